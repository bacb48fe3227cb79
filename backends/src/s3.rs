use crate::backend::{Backend, BackendType, ByteChunks};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use hashvault_core::{Error, Result};
use std::path::Path;
use tracing::debug;

const PRECONDITION_FAILED: u16 = 412;

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Ok(Self {
            client: Client::new(&config),
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// For S3-compatible services such as MinIO.
    pub async fn with_endpoint(bucket: String, prefix: String, endpoint: String) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// Parses `s3://bucket/optional/prefix`.
    pub fn parse_url(url: &str) -> Option<(String, String)> {
        let rest = url.strip_prefix("s3://")?;
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return None;
        }
        Some((bucket.to_string(), prefix.trim_matches('/').to_string()))
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    async fn get_body(&self, key: &str) -> Result<Option<ByteStream>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await;

        match result {
            Ok(response) => Ok(Some(response.body)),
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => Ok(None),
            Err(e) => Err(transport("get", key, e)),
        }
    }

    /// Conditional create: S3 answers 412 when the key already exists.
    async fn put_if_absent(&self, key: &str, body: ByteStream) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .if_none_match("*")
            .body(body)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(PRECONDITION_FAILED) => {
                debug!(key, "Key already present in bucket");
                Ok(false)
            }
            Err(e) => Err(transport("conditional put", key, e)),
        }
    }

    fn strip_key<'k>(&self, key: &'k str) -> &'k str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(key)
        }
    }
}

fn transport<E: std::fmt::Display>(action: &str, key: &str, e: E) -> Error {
    Error::Transport(format!("S3 {} {} failed: {}", action, key, e))
}

#[async_trait]
impl Backend for S3Backend {
    async fn init(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| transport("head bucket", &self.bucket, e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            Err(e) => Err(transport("head", key, e)),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(body) = self.get_body(key).await? else {
            return Ok(None);
        };
        let data = body
            .collect()
            .await
            .map_err(|e| transport("read body of", key, e))?;
        Ok(Some(data.into_bytes()))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| transport("put", key, e))?;
        Ok(())
    }

    async fn write_new(&self, key: &str, data: Bytes) -> Result<bool> {
        self.put_if_absent(key, ByteStream::from(data)).await
    }

    async fn write_new_file(&self, key: &str, file: &Path) -> Result<bool> {
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| transport("open upload for", key, e))?;
        self.put_if_absent(key, body).await
    }

    async fn read_stream(&self, key: &str) -> Result<Option<ByteChunks>> {
        let Some(body) = self.get_body(key).await? else {
            return Ok(None);
        };
        let key = key.to_string();
        let chunks = stream::try_unfold((body, key), |(mut body, key)| async move {
            match body.try_next().await {
                Ok(Some(chunk)) => Ok(Some((chunk, (body, key)))),
                Ok(None) => Ok(None),
                Err(e) => Err(transport("read body of", &key, e)),
            }
        });
        Ok(Some(chunks.boxed()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        // DeleteObject succeeds for absent keys, so existence is checked first.
        if !self.exists(key).await? {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| transport("delete", key, e))?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| transport("list", prefix, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(self.strip_key(key).to_string());
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }

    fn location(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_bucket_and_prefix() {
        assert_eq!(
            S3Backend::parse_url("s3://backups/hosts/web/"),
            Some(("backups".to_string(), "hosts/web".to_string()))
        );
        assert_eq!(
            S3Backend::parse_url("s3://backups"),
            Some(("backups".to_string(), String::new()))
        );
        assert_eq!(S3Backend::parse_url("s3:///x"), None);
        assert_eq!(S3Backend::parse_url("/var/backups"), None);
    }
}
