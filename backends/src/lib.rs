pub mod backend;
pub mod local;
pub mod retry;
pub mod s3;
pub mod store;

pub use backend::{Backend, BackendType};
pub use local::LocalBackend;
pub use retry::{retry_with_backoff, RetryConfig, Retryable};
pub use s3::S3Backend;
pub use store::BackendStore;

use hashvault_core::Result;
use std::sync::Arc;

/// Resolves a store location: `s3://bucket/prefix` or a filesystem path.
/// `endpoint` selects an S3-compatible service instead of AWS.
pub async fn backend_for(location: &str, endpoint: Option<&str>) -> Result<Arc<dyn Backend>> {
    match (S3Backend::parse_url(location), endpoint) {
        (Some((bucket, prefix)), Some(endpoint)) => Ok(Arc::new(
            S3Backend::with_endpoint(bucket, prefix, endpoint.to_string()).await?,
        )),
        (Some((bucket, prefix)), None) => Ok(Arc::new(S3Backend::new(bucket, prefix).await?)),
        (None, _) => Ok(Arc::new(LocalBackend::new(location))),
    }
}
