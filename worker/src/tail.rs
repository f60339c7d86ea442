//! Cola de stdout/stderr de un executor: se guarda en un buffer circular
//! y se manda al servidor cada `log_update_rate`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use common::ring::RingBuffer;
use common::writer::{EventWriter, ExecutorEvents};
use common::Event;

/// Capacidad del canal de actualizaciones hacia el servidor.
pub const UPDATE_QUEUE: usize = 32;
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Escribe en orden los eventos de log. Si el canal se llena, los
/// volcados periódicos se descartan.
pub struct Forwarder {
    tx: mpsc::Sender<Event>,
    handle: JoinHandle<()>,
}

impl Forwarder {
    pub fn spawn(writer: Arc<dyn EventWriter>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(UPDATE_QUEUE);
        let handle = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let Err(e) = writer.write_event(&ev).await {
                    warn!(task_id = %ev.id, "no se pudo enviar el log del executor: {e}");
                }
            }
        });
        Forwarder { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// Espera a que salga todo lo encolado.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!("forwarder de logs terminó mal: {e}");
        }
    }
}

pub struct TailConfig {
    pub size: usize,
    pub rate: Duration,
}

/// Consume los trozos de una salida hasta que el emisor se cierra.
/// Copia todo en `file` si se declaró y conserva los últimos `size` bytes
/// para el servidor.
pub async fn tail(
    stream: Stream,
    mut chunks: mpsc::Receiver<Vec<u8>>,
    mut file: Option<(PathBuf, tokio::fs::File)>,
    exec: ExecutorEvents,
    updates: mpsc::Sender<Event>,
    conf: TailConfig,
) {
    let mut ring = RingBuffer::new(conf.size);
    let mut partial = Vec::new();
    let mut ticker = tokio::time::interval(conf.rate.max(Duration::from_millis(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { break };
                if let Some((path, f)) = file.as_mut() {
                    if let Err(e) = f.write_all(&chunk).await {
                        warn!(path = %path.display(), "no se pudo escribir la salida del executor: {e}");
                        file = None;
                    }
                }
                ring.write(&chunk);
            }
            _ = ticker.tick() => {
                if let Some(ev) = take_event(stream, &mut ring, &mut partial, &exec, false) {
                    if updates.try_send(ev).is_err() {
                        debug!(kind = ?stream, "canal de logs lleno, volcado descartado");
                    }
                }
            }
        }
    }

    if let Some((path, mut f)) = file {
        if let Err(e) = f.flush().await {
            warn!(path = %path.display(), "flush de la salida del executor: {e}");
        }
    }
    if let Some(ev) = take_event(stream, &mut ring, &mut partial, &exec, true) {
        match tokio::time::timeout(FINAL_FLUSH_TIMEOUT, updates.send(ev)).await {
            Ok(Ok(())) => {}
            _ => warn!(kind = ?stream, "volcado final de logs perdido"),
        }
    }
}

/// Vacía el buffer en un evento. Un carácter UTF-8 cortado se guarda para
/// el siguiente volcado salvo en el último.
fn take_event(
    stream: Stream,
    ring: &mut RingBuffer,
    partial: &mut Vec<u8>,
    exec: &ExecutorEvents,
    last: bool,
) -> Option<Event> {
    let mut bytes = std::mem::take(partial);
    bytes.extend(ring.take());
    if bytes.is_empty() {
        return None;
    }
    if !last {
        let cut = utf8_boundary(&bytes);
        *partial = bytes.split_off(cut);
        if bytes.is_empty() {
            return None;
        }
    }
    let chunk = String::from_utf8_lossy(&bytes).into_owned();
    Some(match stream {
        Stream::Stdout => exec.stdout_event(chunk),
        Stream::Stderr => exec.stderr_event(chunk),
    })
}

/// Longitud del prefijo que no termina a mitad de un carácter.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}
