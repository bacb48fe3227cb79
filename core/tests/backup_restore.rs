use bytes::Bytes;
use hashvault_core::walk;
use hashvault_core::{
    BackupOptions, BackupRun, ClientId, Digest, MemoryStore, ObjectStore, ObjectStoreExt,
    RestoreOptions, Restorer, SnapshotLog,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn client() -> ClientId {
    ClientId::new("integration").unwrap()
}

/// Relative path -> (is_dir, content, permission bits).
fn snapshot_fs(root: &Path) -> BTreeMap<PathBuf, (bool, Vec<u8>, u32)> {
    fn visit(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, (bool, Vec<u8>, u32)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let metadata = fs::symlink_metadata(&path).unwrap();
            let relative = path.strip_prefix(root).unwrap().to_path_buf();
            #[cfg(unix)]
            let mode = std::os::unix::fs::MetadataExt::mode(&metadata) & 0o7777;
            #[cfg(not(unix))]
            let mode = 0;
            if metadata.is_dir() {
                out.insert(relative, (true, Vec::new(), mode));
                visit(root, &path, out);
            } else {
                out.insert(relative, (false, fs::read(&path).unwrap(), mode));
            }
        }
    }
    let mut out = BTreeMap::new();
    visit(root, root, &mut out);
    out
}

fn populate(root: &Path) {
    fs::create_dir_all(root.join("a")).unwrap();
    fs::create_dir_all(root.join("b")).unwrap();
    fs::create_dir_all(root.join("src/nested/deeper")).unwrap();
    fs::write(root.join("a/x.txt"), b"hello").unwrap();
    fs::write(root.join("b/x.txt"), b"hello").unwrap();
    fs::write(root.join("src/main.rs"), b"fn main() {}\n").unwrap();
    fs::write(root.join("src/nested/deeper/data.bin"), vec![0xA5u8; 300_000]).unwrap();
    fs::write(root.join("src/nested/empty"), b"").unwrap();
}

#[tokio::test]
async fn test_identical_content_is_stored_once() {
    let source = TempDir::new().unwrap();
    populate(source.path());
    let store = MemoryStore::new();

    let outcome = BackupRun::new(&store, client(), BackupOptions::default())
        .execute(&[source.path().to_path_buf()])
        .await
        .unwrap();

    let hello = Digest::of(b"hello");
    assert!(store.has(&hello).await.unwrap());
    let root = store.get_tree(&outcome.snapshot.root).await.unwrap();
    let a = store.get_tree(&root.get("a").unwrap().digest).await.unwrap();
    let b = store.get_tree(&root.get("b").unwrap().digest).await.unwrap();
    assert_eq!(a.get("x.txt").unwrap().digest, hello);
    assert_eq!(b.get("x.txt").unwrap().digest, hello);
    assert_ne!(outcome.snapshot.root, root.get("a").unwrap().digest);

    // Two "hello" entries, one upload.
    assert_eq!(outcome.build.files, 5);
    assert_eq!(outcome.sync.blobs_uploaded, 4);
}

#[cfg(unix)]
#[tokio::test]
async fn test_identical_directories_are_stored_once() {
    use std::time::{Duration, SystemTime};

    let source = TempDir::new().unwrap();
    let fixed = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    for dir in ["a", "b"] {
        let file = source.path().join(dir).join("x.txt");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"hello").unwrap();
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(fixed)
            .unwrap();
        fs::File::open(source.path().join(dir))
            .unwrap()
            .set_modified(fixed)
            .unwrap();
    }
    let store = MemoryStore::new();

    let outcome = BackupRun::new(&store, client(), BackupOptions::default())
        .execute(&[source.path().to_path_buf()])
        .await
        .unwrap();

    let root = store.get_tree(&outcome.snapshot.root).await.unwrap();
    assert_eq!(root.get("a").unwrap().digest, root.get("b").unwrap().digest);
    assert_eq!(outcome.sync.blobs_uploaded, 1);
    assert_eq!(outcome.sync.trees_uploaded, 2);
    // Root tree, the shared subtree and the shared blob.
    assert_eq!(store.len().await, 3);
}

#[tokio::test]
async fn test_unchanged_tree_backs_up_without_puts() {
    let source = TempDir::new().unwrap();
    populate(source.path());
    let store = MemoryStore::new();
    let paths = [source.path().to_path_buf()];

    let first = BackupRun::new(&store, client(), BackupOptions::default())
        .execute(&paths)
        .await
        .unwrap();
    let puts = store.put_count();

    let second = BackupRun::new(&store, client(), BackupOptions::default())
        .execute(&paths)
        .await
        .unwrap();

    assert_eq!(store.put_count(), puts);
    assert_eq!(second.snapshot.root, first.snapshot.root);
    assert_eq!(second.snapshot.id, first.snapshot.id + 1);
    assert_eq!(second.snapshot.parent, Some(first.snapshot.id));
    assert_eq!(store.snapshots(&client()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_changed_file_uploads_only_new_objects() {
    let source = TempDir::new().unwrap();
    populate(source.path());
    let store = MemoryStore::new();
    let paths = [source.path().to_path_buf()];

    BackupRun::new(&store, client(), BackupOptions::default())
        .execute(&paths)
        .await
        .unwrap();
    fs::write(source.path().join("src/main.rs"), b"fn main() { run() }\n").unwrap();

    let second = BackupRun::new(&store, client(), BackupOptions::default())
        .execute(&paths)
        .await
        .unwrap();

    assert_eq!(second.sync.blobs_uploaded, 1);
    // src and the root changed; nested/ is untouched.
    assert_eq!(second.sync.trees_uploaded, 2);
}

#[tokio::test]
async fn test_restore_reproduces_the_source() {
    let source = TempDir::new().unwrap();
    populate(source.path());
    let store = MemoryStore::new();

    let outcome = BackupRun::new(&store, client(), BackupOptions::default())
        .execute(&[source.path().to_path_buf()])
        .await
        .unwrap();

    let target = TempDir::new().unwrap();
    Restorer::new(&store, RestoreOptions::default())
        .restore_snapshot(&outcome.snapshot, target.path())
        .await
        .unwrap();

    assert_eq!(snapshot_fs(source.path()), snapshot_fs(target.path()));
}

#[tokio::test]
async fn test_committed_snapshots_are_fully_resolvable() {
    let source = TempDir::new().unwrap();
    populate(source.path());
    let store = MemoryStore::new();

    for _ in 0..3 {
        BackupRun::new(&store, client(), BackupOptions::default())
            .execute(&[source.path().to_path_buf()])
            .await
            .unwrap();
    }

    for snapshot in store.snapshots(&client()).await.unwrap() {
        let closure = walk::closure(&store, &snapshot.root).await.unwrap();
        assert!(closure.is_complete());
        for digest in closure.digests() {
            assert!(store.has(&digest).await.unwrap());
        }
    }
}

#[tokio::test]
async fn test_put_contract() {
    let store = MemoryStore::new();
    let data = Bytes::from_static(b"payload");
    let digest = Digest::of(&data);

    store.put(&digest, data.clone()).await.unwrap();
    store.put(&digest, data.clone()).await.unwrap();
    assert_eq!(store.len().await, 1);
    assert_eq!(store.get(&digest).await.unwrap(), data);

    let err = store
        .put(&Digest::of(b"other"), data.clone())
        .await
        .unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(store.len().await, 1);
    assert_eq!(Digest::of(&data), digest);
}
