//! Backends de almacenamiento para entradas y salidas de las tareas.

mod http;
mod local;

pub use http::HttpStorage;
pub use local::LocalStorage;

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use common::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Put,
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::List => "list",
        })
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} not supported for {url}")]
    Unsupported { url: String, op: Operation },
    #[error("path is not in allowed directories: {0}")]
    NotAllowed(PathBuf),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StorageError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Objeto remoto tras una transferencia o un listado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub url: String,
    pub size: u64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn supports(&self, url: &str, op: Operation) -> bool;

    /// Descarga `url` en `dest`, creando los directorios que falten.
    async fn get(&self, url: &str, dest: &Path) -> Result<Object, StorageError>;

    async fn put(&self, url: &str, src: &Path) -> Result<Object, StorageError>;

    /// Objetos bajo el prefijo `url`, recursivo.
    async fn list(&self, url: &str) -> Result<Vec<Object>, StorageError>;

    fn join(&self, url: &str, rel: &str) -> String {
        format!("{}/{}", url.trim_end_matches('/'), rel.trim_start_matches('/'))
    }
}

/// Conjunto de backends registrados; cada operación va al primero que la acepte.
#[derive(Clone, Default)]
pub struct Mux {
    backends: Vec<Arc<dyn Storage>>,
}

impl Mux {
    pub fn new(backends: Vec<Arc<dyn Storage>>) -> Self {
        Mux { backends }
    }

    pub fn from_config(conf: &Config) -> Result<Self, StorageError> {
        let mut backends: Vec<Arc<dyn Storage>> = Vec::new();
        if !conf.local_storage.disabled {
            backends.push(Arc::new(LocalStorage::new(conf.local_storage.allowed_dirs.clone())));
        }
        if !conf.http_storage.disabled {
            backends.push(Arc::new(HttpStorage::new(&conf.http_storage)?));
        }
        Ok(Mux { backends })
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn find(&self, url: &str, op: Operation) -> Result<&Arc<dyn Storage>, StorageError> {
        self.backends
            .iter()
            .find(|b| b.supports(url, op))
            .ok_or_else(|| StorageError::Unsupported {
                url: url.to_string(),
                op,
            })
    }
}

#[async_trait]
impl Storage for Mux {
    fn supports(&self, url: &str, op: Operation) -> bool {
        self.backends.iter().any(|b| b.supports(url, op))
    }

    async fn get(&self, url: &str, dest: &Path) -> Result<Object, StorageError> {
        self.find(url, Operation::Get)?.get(url, dest).await
    }

    async fn put(&self, url: &str, src: &Path) -> Result<Object, StorageError> {
        self.find(url, Operation::Put)?.put(url, src).await
    }

    async fn list(&self, url: &str) -> Result<Vec<Object>, StorageError> {
        self.find(url, Operation::List)?.list(url).await
    }

    fn join(&self, url: &str, rel: &str) -> String {
        match self.backends.iter().find(|b| b.supports(url, Operation::Put)) {
            Some(b) => b.join(url, rel),
            None => format!("{}/{}", url.trim_end_matches('/'), rel.trim_start_matches('/')),
        }
    }
}
