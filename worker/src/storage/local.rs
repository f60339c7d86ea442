use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Object, Operation, Storage, StorageError};
use crate::util::walk_files;

/// Ficheros locales: URLs `file://` y rutas absolutas.
#[derive(Debug, Clone, Default)]
pub struct LocalStorage {
    allowed_dirs: Vec<PathBuf>,
}

impl LocalStorage {
    /// Sin directorios permitidos se accede a cualquier ruta.
    pub fn new(allowed_dirs: Vec<PathBuf>) -> Self {
        LocalStorage { allowed_dirs }
    }

    fn path(&self, url: &str, op: Operation) -> Result<PathBuf, StorageError> {
        let path = local_path(url).ok_or_else(|| StorageError::Unsupported {
            url: url.to_string(),
            op,
        })?;
        let path = crate::mapper::clean(&path);
        if !self.allowed_dirs.is_empty() && !self.allowed_dirs.iter().any(|d| path.starts_with(d)) {
            return Err(StorageError::NotAllowed(path));
        }
        Ok(path)
    }
}

fn local_path(url: &str) -> Option<PathBuf> {
    let raw = url.strip_prefix("file://").unwrap_or(url);
    if raw.starts_with('/') {
        Some(PathBuf::from(raw))
    } else {
        None
    }
}

/// Enlace duro si se puede; si no, copia.
async fn link_or_copy(src: &Path, dest: &Path) -> Result<u64, StorageError> {
    let meta = tokio::fs::metadata(src).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(src.display().to_string()),
        _ => StorageError::Io {
            path: src.to_path_buf(),
            source: e,
        },
    })?;
    if meta.is_dir() {
        return Err(StorageError::Io {
            path: src.to_path_buf(),
            source: std::io::Error::other("is a directory"),
        });
    }
    if src == dest {
        return Ok(meta.len());
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(StorageError::io(parent))?;
    }
    let _ = tokio::fs::remove_file(dest).await;
    if tokio::fs::hard_link(src, dest).await.is_err() {
        debug!(src = %src.display(), "enlace duro imposible, copiando");
        tokio::fs::copy(src, dest).await.map_err(StorageError::io(dest))?;
    }
    Ok(meta.len())
}

#[async_trait]
impl Storage for LocalStorage {
    fn supports(&self, url: &str, _op: Operation) -> bool {
        local_path(url).is_some()
    }

    async fn get(&self, url: &str, dest: &Path) -> Result<Object, StorageError> {
        let src = self.path(url, Operation::Get)?;
        let size = link_or_copy(&src, dest).await?;
        Ok(Object {
            url: url.to_string(),
            size,
        })
    }

    async fn put(&self, url: &str, src: &Path) -> Result<Object, StorageError> {
        let dest = self.path(url, Operation::Put)?;
        let size = link_or_copy(src, &dest).await?;
        Ok(Object {
            url: url.to_string(),
            size,
        })
    }

    async fn list(&self, url: &str) -> Result<Vec<Object>, StorageError> {
        let dir = self.path(url, Operation::List)?;
        if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(StorageError::NotFound(url.to_string()));
        }
        let files = walk_files(&dir).map_err(StorageError::io(&dir))?;
        Ok(files
            .into_iter()
            .map(|f| Object {
                url: self.join(url, &f.rel),
                size: f.size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("funnel-local-{name}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn get_put_and_list() {
        let root = scratch("rw");
        let src = root.join("remote/in.txt");
        tokio::fs::create_dir_all(src.parent().unwrap()).await.unwrap();
        tokio::fs::write(&src, b"abc").await.unwrap();

        let s = LocalStorage::new(vec![root.clone()]);
        let url = format!("file://{}", src.display());
        let dest = root.join("work/nested/in.txt");
        let obj = s.get(&url, &dest).await.unwrap();
        assert_eq!(obj.size, 3);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"abc");

        let out_url = format!("{}/remote/sub/out.txt", root.display());
        s.put(&out_url, &dest).await.unwrap();

        let listed = s.list(&format!("file://{}/remote", root.display())).await.unwrap();
        let mut urls: Vec<String> = listed.into_iter().map(|o| o.url).collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                format!("file://{}/remote/in.txt", root.display()),
                format!("file://{}/remote/sub/out.txt", root.display()),
            ]
        );
        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn refuses_paths_outside_allowed_dirs() {
        let s = LocalStorage::new(vec![PathBuf::from("/allowed")]);
        let err = s.get("file:///allowed/../etc/passwd", Path::new("/tmp/x")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let s = LocalStorage::default();
        let err = s
            .get(&format!("{}/nope", scratch("missing").display()), Path::new("/tmp/nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn relative_urls_are_not_local() {
        assert!(!LocalStorage::default().supports("data/x", Operation::Get));
        assert!(!LocalStorage::default().supports("http://h/x", Operation::Get));
    }
}
