pub mod backup;
pub mod builder;
pub mod error;
pub mod gc;
pub mod hasher;
pub mod memory;
pub mod restore;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod tree;
pub mod types;
pub mod verify;
pub mod walk;

pub use backup::{BackupOptions, BackupOutcome, BackupPlan, BackupRun, ParentSelection, RunState};
pub use builder::{BuildOptions, BuildOutput, BuildStats, TreeBuilder};
pub use error::{Error, Result};
pub use gc::{collect_garbage, GcReport};
pub use memory::MemoryStore;
pub use restore::{RestoreOptions, RestoreStats, Restorer};
pub use snapshot::{NewSnapshot, Snapshot, SnapshotLog, SnapshotManager};
pub use store::{ObjectStore, ObjectStoreExt, Store};
pub use sync::{SyncNegotiator, SyncPlan, SyncReport};
pub use tree::{EntryKind, EntryMeta, Tree, TreeEntry};
pub use types::*;
pub use verify::{check_snapshot, CheckReport};
