//! Descarga de entradas y subida de salidas con paralelismo acotado.

use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use common::events::fields;
use common::writer::TaskEvents;
use common::{Context, FileType, OutputFileLog};

use crate::error::WorkerError;
use crate::mapper::{clean, is_subpath, MappedInput, MappedOutput};
use crate::storage::{Operation, Storage, StorageError};
use crate::util::walk_files;

/// Comprueba que cada URL tiene un backend antes de mover nada.
pub fn validate(
    store: &dyn Storage,
    inputs: &[MappedInput],
    outputs: &[MappedOutput],
) -> Result<(), WorkerError> {
    for input in inputs.iter().filter(|i| i.content.is_empty()) {
        let op = match input.kind {
            FileType::File => Operation::Get,
            FileType::Directory => Operation::List,
        };
        if !store.supports(&input.url, op) {
            return Err(WorkerError::System(format!(
                "input download not supported by storage: {}",
                input.url
            )));
        }
    }
    for output in outputs {
        if !store.supports(&output.url, Operation::Put) {
            return Err(WorkerError::System(format!(
                "output upload not supported by storage: {}",
                output.url
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Download {
    url: String,
    path: PathBuf,
}

/// Expande los directorios de entrada a un fichero por objeto listado y
/// escribe las entradas con contenido en línea.
async fn flatten_inputs(
    inputs: &[MappedInput],
    store: &dyn Storage,
    events: &TaskEvents,
) -> Result<Vec<Download>, WorkerError> {
    let mut flat = Vec::new();
    for input in inputs {
        if !input.content.is_empty() {
            if let Some(parent) = input.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&input.path, input.content.as_bytes()).await?;
            continue;
        }
        match input.kind {
            FileType::File => flat.push(Download {
                url: input.url.clone(),
                path: input.path.clone(),
            }),
            FileType::Directory => {
                let listed = store
                    .list(&input.url)
                    .await
                    .map_err(|e| WorkerError::System(format!("listing directory: {e}")))?;
                if listed.is_empty() {
                    events
                        .warn("download source directory is empty", fields([("url", &input.url)]))
                        .await;
                    tokio::fs::create_dir_all(&input.path).await?;
                }
                let prefix = format!("{}/", input.url.trim_end_matches('/'));
                for obj in listed {
                    let rel = obj.url.strip_prefix(&prefix).unwrap_or(&obj.url);
                    let path = clean(&input.path.join(rel.trim_start_matches('/')));
                    if !is_subpath(&path, &input.path) {
                        return Err(WorkerError::System(format!(
                            "listed object escapes the input directory: {}",
                            obj.url
                        )));
                    }
                    flat.push(Download { url: obj.url, path });
                }
            }
        }
    }
    Ok(flat)
}

/// Descarga todas las entradas. El primer fallo cancela el resto.
pub async fn download_inputs(
    ctx: &Context,
    inputs: &[MappedInput],
    store: Arc<dyn Storage>,
    events: &TaskEvents,
    limit: usize,
) -> Result<(), WorkerError> {
    let flat = flatten_inputs(inputs, store.as_ref(), events).await?;
    let batch = ctx.child();

    let results: Vec<Result<(), String>> = stream::iter(flat)
        .map(|d| {
            let store = store.clone();
            let batch = batch.clone();
            async move {
                if batch.is_cancelled() {
                    return Err(String::from("canceled"));
                }
                events.info("download started", fields([("url", &d.url)])).await;
                let res = tokio::select! {
                    _ = batch.cancelled() => Err(String::from("canceled")),
                    r = store.get(&d.url, &d.path) => r.map_err(|e| e.to_string()),
                };
                match res {
                    Ok(obj) => {
                        events
                            .info(
                                "download finished",
                                fields([("url", d.url.clone()), ("size", obj.size.to_string())]),
                            )
                            .await;
                        Ok(())
                    }
                    Err(e) => {
                        if !batch.is_cancelled() {
                            events
                                .error(
                                    "download failed",
                                    fields([("url", d.url.as_str()), ("error", e.as_str())]),
                                )
                                .await;
                            batch.cancel();
                        }
                        Err(e)
                    }
                }
            }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    if ctx.is_cancelled() {
        return Err(WorkerError::Canceled);
    }
    let errors: Vec<String> = results
        .into_iter()
        .filter_map(Result::err)
        .filter(|e| e != "canceled")
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::System(format!("download failed: {}", errors.join("; "))))
    }
}

#[derive(Debug, Clone)]
struct Upload {
    url: String,
    path: PathBuf,
}

fn flatten_outputs_sync(
    outputs: &[MappedOutput],
    store: &dyn Storage,
) -> Result<(Vec<Upload>, Vec<String>), WorkerError> {
    let mut flat = Vec::new();
    let mut empty = Vec::new();
    for output in outputs {
        match output.kind {
            FileType::File => flat.push(Upload {
                url: output.url.clone(),
                path: output.path.clone(),
            }),
            FileType::Directory => {
                let files = walk_files(&output.path)
                    .map_err(|e| WorkerError::System(format!("walking directory: {e}")))?;
                if files.is_empty() {
                    empty.push(output.url.clone());
                }
                for f in files {
                    flat.push(Upload {
                        url: store.join(&output.url, &f.rel),
                        path: f.abs,
                    });
                }
            }
        }
    }
    Ok((flat, empty))
}

/// Sube las salidas. Devuelve los ficheros subidos aunque alguno falle;
/// `path` queda en ruta del host.
pub async fn upload_outputs(
    ctx: &Context,
    outputs: &[MappedOutput],
    store: Arc<dyn Storage>,
    events: &TaskEvents,
    limit: usize,
) -> (Vec<OutputFileLog>, Result<(), WorkerError>) {
    let (flat, empty) = match flatten_outputs_sync(outputs, store.as_ref()) {
        Ok(f) => f,
        Err(e) => return (Vec::new(), Err(e)),
    };
    for url in empty {
        events
            .warn("upload source directory is empty", fields([("url", url)]))
            .await;
    }

    let results: Vec<Result<OutputFileLog, String>> = stream::iter(flat)
        .map(|u| {
            let store = store.clone();
            async move {
                events.info("upload started", fields([("url", &u.url)])).await;
                let res: Result<_, StorageError> = tokio::select! {
                    _ = ctx.cancelled() => return Err(String::from("canceled")),
                    r = store.put(&u.url, &u.path) => r,
                };
                match res {
                    Ok(obj) => {
                        events
                            .info(
                                "upload finished",
                                fields([("url", obj.url.clone()), ("size", obj.size.to_string())]),
                            )
                            .await;
                        Ok(OutputFileLog {
                            url: obj.url,
                            path: u.path.to_string_lossy().into_owned(),
                            size_bytes: obj.size.to_string(),
                        })
                    }
                    Err(e) => {
                        let e = e.to_string();
                        events
                            .error(
                                "upload failed",
                                fields([("url", u.url.as_str()), ("error", e.as_str())]),
                            )
                            .await;
                        Err(e)
                    }
                }
            }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    let mut logs = Vec::new();
    let mut errors = Vec::new();
    for r in results {
        match r {
            Ok(log) => logs.push(log),
            Err(e) => errors.push(e),
        }
    }
    logs.sort_by(|a, b| a.url.cmp(&b.url));
    debug!(task_id = %events.id(), uploaded = logs.len(), failed = errors.len(), "salidas subidas");

    let result = if ctx.is_cancelled() {
        Err(WorkerError::Canceled)
    } else if errors.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::System(format!("upload failed: {}", errors.join("; "))))
    };
    (logs, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, Object};
    use async_trait::async_trait;
    use common::writer::EventWriter;
    use common::{Event, Payload};
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventWriter for Recorder {
        async fn write_event(&self, ev: &Event) -> Result<(), common::writer::WriteError> {
            self.0.lock().unwrap().push(ev.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn messages(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match &e.payload {
                    Payload::SystemLog(l) => Some(l.msg.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("funnel-transfer-{name}-{}", uuid::Uuid::new_v4()))
    }

    fn input(url: &str, path: PathBuf) -> MappedInput {
        MappedInput {
            url: url.into(),
            path,
            container_path: String::new(),
            kind: FileType::File,
            content: String::new(),
        }
    }

    /// Falla las URLs que contienen "bad" y cuelga las que contienen "slow".
    struct Flaky;

    #[async_trait]
    impl Storage for Flaky {
        fn supports(&self, _url: &str, _op: Operation) -> bool {
            true
        }
        async fn get(&self, url: &str, _dest: &Path) -> Result<Object, StorageError> {
            if url.contains("bad") {
                return Err(StorageError::NotFound(url.into()));
            }
            if url.contains("slow") {
                std::future::pending::<()>().await;
            }
            Ok(Object { url: url.into(), size: 1 })
        }
        async fn put(&self, url: &str, _src: &Path) -> Result<Object, StorageError> {
            Ok(Object { url: url.into(), size: 1 })
        }
        async fn list(&self, _url: &str) -> Result<Vec<Object>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn inline_content_and_directories_are_staged() {
        let root = scratch("stage");
        let remote = root.join("remote");
        tokio::fs::create_dir_all(remote.join("sub")).await.unwrap();
        tokio::fs::write(remote.join("a.txt"), b"a").await.unwrap();
        tokio::fs::write(remote.join("sub/b.txt"), b"bb").await.unwrap();

        let work = root.join("work");
        let mut inline = input("", work.join("inline/script.sh"));
        inline.content = "echo hi\n".into();
        let mut dir = input(&format!("file://{}", remote.display()), work.join("in"));
        dir.kind = FileType::Directory;

        let rec = Arc::new(Recorder::default());
        let events = TaskEvents::new("t1", 0, rec.clone());
        let store: Arc<dyn Storage> = Arc::new(LocalStorage::default());
        download_inputs(&Context::background(), &[inline, dir], store, &events, 2)
            .await
            .unwrap();

        assert_eq!(tokio::fs::read_to_string(work.join("inline/script.sh")).await.unwrap(), "echo hi\n");
        assert_eq!(tokio::fs::read(work.join("in/a.txt")).await.unwrap(), b"a");
        assert_eq!(tokio::fs::read(work.join("in/sub/b.txt")).await.unwrap(), b"bb");
        let msgs = rec.messages();
        assert_eq!(msgs.iter().filter(|m| *m == "download finished").count(), 2);
        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn one_failure_cancels_the_rest() {
        let root = scratch("fail");
        let rec = Arc::new(Recorder::default());
        let events = TaskEvents::new("t1", 0, rec.clone());
        let inputs = vec![input("x://slow", root.join("slow")), input("x://bad", root.join("bad"))];

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            download_inputs(&Context::background(), &inputs, Arc::new(Flaky), &events, 4),
        )
        .await
        .expect("slow download was not canceled")
        .unwrap_err();
        assert!(matches!(err, WorkerError::System(m) if m.contains("not found")));
        assert_eq!(rec.messages().iter().filter(|m| *m == "download failed").count(), 1);
    }

    #[tokio::test]
    async fn canceled_context_aborts_downloads() {
        let ctx = Context::background();
        let events = TaskEvents::new("t1", 0, Arc::new(Recorder::default()));
        let inputs = vec![input("x://slow", scratch("cancel"))];
        let c = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            c.cancel();
        });
        let err = download_inputs(&ctx, &inputs, Arc::new(Flaky), &events, 1).await.unwrap_err();
        assert!(matches!(err, WorkerError::Canceled));
    }

    #[tokio::test]
    async fn directory_outputs_map_to_joined_urls() {
        let root = scratch("out");
        let host = root.join("work/out");
        tokio::fs::create_dir_all(host.join("deep")).await.unwrap();
        tokio::fs::write(host.join("r1.txt"), b"1").await.unwrap();
        tokio::fs::write(host.join("deep/r2.txt"), b"22").await.unwrap();
        let dest = root.join("results");
        let outputs = vec![MappedOutput {
            url: format!("file://{}", dest.display()),
            path: host.clone(),
            container_path: "/out".into(),
            kind: FileType::Directory,
        }];

        let events = TaskEvents::new("t1", 0, Arc::new(Recorder::default()));
        let store: Arc<dyn Storage> = Arc::new(LocalStorage::default());
        let (logs, res) = upload_outputs(&Context::background(), &outputs, store, &events, 3).await;
        res.unwrap();

        let urls: Vec<&str> = logs.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                format!("file://{}/deep/r2.txt", dest.display()),
                format!("file://{}/r1.txt", dest.display()),
            ]
        );
        assert_eq!(logs[0].size_bytes, "2");
        assert_eq!(tokio::fs::read(dest.join("deep/r2.txt")).await.unwrap(), b"22");
        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[test]
    fn validation_needs_a_backend_per_url() {
        let store = LocalStorage::default();
        let ok = input("file:///ref.fa", PathBuf::from("/w/ref.fa"));
        assert!(validate(&store, &[ok], &[]).is_ok());
        let remote = input("s3://bucket/ref.fa", PathBuf::from("/w/ref.fa"));
        assert!(validate(&store, &[remote], &[]).is_err());
        let mut inline = input("", PathBuf::from("/w/x"));
        inline.content = "x".into();
        assert!(validate(&store, &[inline], &[]).is_ok());
    }
}
