//! Traducción de rutas de contenedor a rutas del host dentro del
//! directorio de trabajo de la tarea.

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use common::{FileType, Input, Output, Task};

#[derive(Debug, Error)]
pub enum MapError {
    #[error("invalid path {0}: escapes the working directory")]
    Escape(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MapError + '_ {
    move |source| MapError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedInput {
    pub url: String,
    /// Ruta en el host.
    pub path: PathBuf,
    pub container_path: String,
    pub kind: FileType,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedOutput {
    pub url: String,
    pub path: PathBuf,
    pub container_path: String,
    pub kind: FileType,
}

/// Mapa de ficheros de una tarea. Toda ruta que produce está dentro de `dir`.
#[derive(Debug, Clone)]
pub struct FileMapper {
    dir: PathBuf,
    pub volumes: Vec<Volume>,
    pub inputs: Vec<MappedInput>,
    pub outputs: Vec<MappedOutput>,
}

impl FileMapper {
    /// `dir` se hace absoluto respecto al directorio actual.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, MapError> {
        let dir = dir.as_ref();
        let abs = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir().map_err(io_err(dir))?.join(dir)
        };
        Ok(FileMapper {
            dir: clean(&abs),
            volumes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ruta del host para una ruta del contenedor. Falla si el resultado
    /// queda fuera del directorio de trabajo.
    pub fn host_path(&self, container: &str) -> Result<PathBuf, MapError> {
        let p = clean(&self.dir.join(container.trim_start_matches('/')));
        if !is_subpath(&p, &self.dir) {
            return Err(MapError::Escape(container.to_string()));
        }
        Ok(p)
    }

    /// Inversa de [`host_path`](Self::host_path).
    pub fn container_path(&self, host: &Path) -> String {
        match host.strip_prefix(&self.dir) {
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => host.to_string_lossy().into_owned(),
        }
    }

    /// Registra un montaje. Entre montajes de escritura se queda el más
    /// externo: un hijo de uno existente se descarta y uno existente que
    /// cuelga del nuevo se sustituye.
    pub fn add_volume(&mut self, host_path: PathBuf, container_path: &str, readonly: bool) {
        let vol = Volume {
            host_path,
            container_path: container_path.to_string(),
            readonly,
        };
        let new_path = Path::new(&vol.container_path);
        for v in &self.volumes {
            if *v == vol {
                return;
            }
            if !vol.readonly && !v.readonly && is_subpath(new_path, Path::new(&v.container_path)) {
                return;
            }
        }
        if !vol.readonly {
            self.volumes.retain(|v| {
                v.readonly || !is_subpath(Path::new(&v.container_path), new_path)
            });
        }
        self.volumes.push(vol);
    }

    /// Directorio vacío de escritura (volúmenes de la tarea y /tmp).
    pub fn add_tmp_volume(&mut self, container: &str) -> Result<(), MapError> {
        let host = self.host_path(container)?;
        std::fs::create_dir_all(&host).map_err(io_err(&host))?;
        self.add_volume(host, container, false);
        Ok(())
    }

    pub fn add_input(&mut self, input: &Input) -> Result<(), MapError> {
        let host = self.host_path(&input.path)?;
        if let Some(parent) = host.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        self.add_volume(host.clone(), &input.path, true);
        self.inputs.push(MappedInput {
            url: input.url.clone(),
            container_path: self.container_path(&host),
            path: host,
            kind: input.kind,
            content: input.content.clone(),
        });
        Ok(())
    }

    /// Un fichero de salida monta su directorio padre; un directorio se monta entero.
    pub fn add_output(&mut self, output: &Output) -> Result<(), MapError> {
        let host = self.host_path(&output.path)?;
        let (mount_host, mount_container) = match output.kind {
            FileType::Directory => (host.clone(), output.path.clone()),
            FileType::File => {
                let parent = host
                    .parent()
                    .filter(|p| is_subpath(p, &self.dir))
                    .unwrap_or(&self.dir)
                    .to_path_buf();
                let container = self.container_path(&parent);
                (parent, container)
            }
        };
        std::fs::create_dir_all(&mount_host).map_err(io_err(&mount_host))?;
        self.add_volume(mount_host, &mount_container, false);
        self.outputs.push(MappedOutput {
            url: output.url.clone(),
            container_path: self.container_path(&host),
            path: host,
            kind: output.kind,
        });
        Ok(())
    }

    pub fn map_task(&mut self, task: &Task) -> Result<(), MapError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        for v in &task.volumes {
            self.add_tmp_volume(v)?;
        }
        self.add_tmp_volume("/tmp")?;
        for input in &task.inputs {
            self.add_input(input)?;
        }
        for output in &task.outputs {
            self.add_output(output)?;
        }
        Ok(())
    }

    pub async fn cleanup(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Normalización léxica: quita `.` y resuelve `..` sin tocar el disco.
pub fn clean(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !p.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// `p` es `base` o cuelga de ella, comparando por componentes.
pub fn is_subpath(p: &Path, base: &Path) -> bool {
    p.starts_with(base)
}
