use common::Event;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::warn;

/// Diario de eventos: un JSON por línea, solo se añade al final.
#[derive(Debug)]
pub struct Journal {
    file: File,
}

impl Journal {
    /// Abre (o crea) el diario y devuelve los eventos ya guardados.
    pub fn open(path: &Path) -> std::io::Result<(Journal, Vec<Event>)> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut events = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(ev) => events.push(ev),
                    // una línea cortada al final (caída a mitad de escritura) no es fatal
                    Err(e) => warn!("línea {} del diario ignorada: {}", n + 1, e),
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((Journal { file }, events))
    }

    pub fn append(&mut self, ev: &Event) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(ev)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()
    }
}
