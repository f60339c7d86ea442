use std::sync::{Mutex, PoisonError};
use ulid::{Generator, Ulid};

/// Genera ids ordenables (ULID monótono): dentro del mismo milisegundo
/// el siguiente id siempre es mayor que el anterior.
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator {
            inner: Mutex::new(Generator::new()),
        }
    }

    pub fn next_id(&self) -> String {
        let mut g = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match g.generate() {
            Ok(id) => id.to_string(),
            // desbordamiento del componente aleatorio: se sigue con un ULID nuevo
            Err(_) => Ulid::new().to_string(),
        }
    }
}

pub fn is_valid_id(s: &str) -> bool {
    Ulid::from_string(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids_gen = IdGenerator::new();
        let ids: Vec<String> = (0..500).map(|_| ids_gen.next_id()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(ids.iter().all(|id| is_valid_id(id)));
    }
}
