use std::collections::VecDeque;

/// Buffer circular de bytes: conserva como mucho `cap` bytes, los más recientes.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        RingBuffer {
            buf: VecDeque::with_capacity(cap.min(64 * 1024)),
            cap,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        if self.cap == 0 {
            return;
        }
        // si el bloque ya supera la capacidad solo cuenta su cola
        let data = if data.len() > self.cap {
            &data[data.len() - self.cap..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Vacía el buffer devolviendo su contenido.
    pub fn take(&mut self) -> Vec<u8> {
        self.buf.drain(..).collect()
    }
}
