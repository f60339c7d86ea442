use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{Object, Operation, Storage, StorageError};
use common::config::HttpStorageConfig;

/// Solo lectura: GET sobre http(s).
#[derive(Debug, Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
}

impl HttpStorage {
    pub fn new(conf: &HttpStorageConfig) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs))
            .build()?;
        Ok(HttpStorage { client })
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[async_trait]
impl Storage for HttpStorage {
    fn supports(&self, url: &str, op: Operation) -> bool {
        is_http(url) && op == Operation::Get
    }

    async fn get(&self, url: &str, dest: &Path) -> Result<Object, StorageError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::io(parent))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(StorageError::io(dest))?;
        let mut size = 0u64;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(StorageError::io(dest))?;
        }
        file.flush().await.map_err(StorageError::io(dest))?;
        Ok(Object {
            url: url.to_string(),
            size,
        })
    }

    async fn put(&self, url: &str, _src: &Path) -> Result<Object, StorageError> {
        Err(StorageError::Unsupported {
            url: url.to_string(),
            op: Operation::Put,
        })
    }

    async fn list(&self, url: &str) -> Result<Vec<Object>, StorageError> {
        Err(StorageError::Unsupported {
            url: url.to_string(),
            op: Operation::List,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_reads() {
        let s = HttpStorage::new(&HttpStorageConfig::default()).unwrap();
        assert!(s.supports("https://example.org/ref.fa", Operation::Get));
        assert!(!s.supports("https://example.org/ref.fa", Operation::Put));
        assert!(!s.supports("file:///ref.fa", Operation::Get));
        let err = s.put("https://example.org/out", Path::new("/tmp/out")).await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { op: Operation::Put, .. }));
    }
}
