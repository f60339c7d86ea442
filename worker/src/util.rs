use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use sysinfo::{DiskExt, System, SystemExt};
use tracing::debug;

use crate::mapper::FileMapper;

/// Fichero encontrado al recorrer un directorio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub abs: PathBuf,
    /// Relativa al directorio recorrido, con `/`.
    pub rel: String,
    pub size: u64,
}

/// Ficheros regulares bajo `dir`, recursivo y ordenado. Los enlaces a
/// ficheros cuentan; los enlaces a directorios no se siguen.
pub fn walk_files(dir: &Path) -> io::Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let pattern = format!("{}/*", glob::Pattern::escape(&current.to_string_lossy()));
        let paths = glob::glob(&pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        for entry in paths {
            let path = entry.map_err(|e| e.into_error())?;
            let Ok(own) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            let meta = if own.file_type().is_symlink() {
                match std::fs::metadata(&path) {
                    Ok(m) if m.is_dir() => continue,
                    Ok(m) => m,
                    // enlace roto
                    Err(_) => continue,
                }
            } else {
                own
            };
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            let rel = path
                .strip_prefix(dir)
                .map(|r| r.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            out.push(FileEntry {
                abs: path,
                rel,
                size: meta.len(),
            });
        }
    }
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

/// Dirección vista en una interfaz del host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddr {
    pub ip: IpAddr,
    pub up: bool,
    pub loopback: bool,
}

/// Primera IPv4 de una interfaz levantada que no sea loopback.
pub fn first_external_ipv4<I>(addrs: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = IfaceAddr>,
{
    addrs.into_iter().find_map(|a| match a.ip {
        IpAddr::V4(ip) if a.up && !a.loopback && !ip.is_loopback() && !ip.is_unspecified() => {
            Some(ip)
        }
        _ => None,
    })
}

/// IPv4 externa del host, recorriendo sus interfaces.
#[cfg(unix)]
pub fn external_ip() -> Option<String> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addrs = match getifaddrs() {
        Ok(a) => a,
        Err(e) => {
            debug!("no se pudieron listar las interfaces: {e}");
            return None;
        }
    };
    let candidates = addrs.filter_map(|ifa| {
        let sin = ifa.address.as_ref()?.as_sockaddr_in()?;
        Some(IfaceAddr {
            ip: IpAddr::V4(Ipv4Addr::from(sin.ip())),
            up: ifa.flags.contains(InterfaceFlags::IFF_UP),
            loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
        })
    });
    first_external_ipv4(candidates).map(|ip| ip.to_string())
}

#[cfg(not(unix))]
pub fn external_ip() -> Option<String> {
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostResources {
    pub cpus: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
}

/// CPU, memoria y disco del host; el disco es el que contiene `work_dir`.
pub fn host_resources(work_dir: &Path) -> HostResources {
    let sys = System::new_all();
    let work_dir = if work_dir.is_absolute() {
        work_dir.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(work_dir)
    };
    let disk_gb = sys
        .disks()
        .iter()
        .filter(|d| work_dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.total_space() as f64 / 1e9)
        .unwrap_or(0.0);
    HostResources {
        cpus: sys.cpus().len() as u32,
        ram_gb: sys.total_memory() as f64 / 1e9,
        disk_gb,
    }
}

/// Rehace los enlaces simbólicos rotos que apuntan a rutas del contenedor
/// cuando esa ruta existe mapeada en el host.
#[cfg(unix)]
pub fn fix_links(mapper: &FileMapper, base: &Path) {
    let mut pending = vec![base.to_path_buf()];
    while let Some(p) = pending.pop() {
        let Ok(meta) = std::fs::symlink_metadata(&p) else {
            continue;
        };
        if meta.is_dir() {
            if let Ok(entries) = std::fs::read_dir(&p) {
                pending.extend(entries.flatten().map(|e| e.path()));
            }
            continue;
        }
        if !meta.file_type().is_symlink() || p.exists() {
            continue;
        }
        let Ok(target) = std::fs::read_link(&p) else {
            continue;
        };
        let Ok(mapped) = mapper.host_path(&target.to_string_lossy()) else {
            continue;
        };
        if !mapped.exists() {
            continue;
        }
        if std::fs::remove_file(&p).is_ok() {
            match std::os::unix::fs::symlink(&mapped, &p) {
                Ok(()) => debug!(link = %p.display(), target = %mapped.display(), "enlace reparado"),
                Err(e) => debug!(link = %p.display(), "no se pudo rehacer el enlace: {e}"),
            }
        }
    }
}

#[cfg(not(unix))]
pub fn fix_links(_mapper: &FileMapper, _base: &Path) {}
