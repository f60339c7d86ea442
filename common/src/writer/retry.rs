use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::{EventWriter, WriteError};
use crate::events::Event;

/// Backoff exponencial acotado: `initial * multiplier^(n-1)`, sin pasar de `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Intentos totales, incluido el primero.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Espera tras el intento fallido número `attempt` (empezando en 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Reintenta errores transitorios del writer interno.
pub struct RetryWriter<W> {
    inner: W,
    policy: RetryPolicy,
}

impl<W: EventWriter> RetryWriter<W> {
    pub fn new(inner: W, policy: RetryPolicy) -> Self {
        RetryWriter { inner, policy }
    }
}

#[async_trait]
impl<W: EventWriter> EventWriter for RetryWriter<W> {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        let mut attempt = 1;
        loop {
            match self.inner.write_event(ev).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let wait = self.policy.delay(attempt);
                    debug!(task_id = %ev.id, attempt, ?wait, "reintentando evento: {e}");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(task_id = %ev.id, attempt, "se agotaron los reintentos: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::State;
    use crate::writer::testing::Recorder;
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_secs(1));
        assert_eq!(p.delay(3), Duration::from_secs(2));
        assert_eq!(p.delay(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let rec = Arc::new(Recorder::default());
        {
            let mut fail = rec.fail.lock().unwrap();
            fail.push(WriteError::Transient("a".into()));
            fail.push(WriteError::Transient("b".into()));
        }
        let w = RetryWriter::new(rec.clone(), fast());
        w.write_event(&Event::state("t1", State::Running)).await.unwrap();
        assert_eq!(rec.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let rec = Arc::new(Recorder::default());
        {
            let mut fail = rec.fail.lock().unwrap();
            fail.push(WriteError::Transient("later".into()));
            fail.push(WriteError::NotFound("t1".into()));
        }
        let w = RetryWriter::new(rec.clone(), fast());
        let err = w.write_event(&Event::state("t1", State::Running)).await.unwrap_err();
        assert_eq!(err, WriteError::NotFound("t1".into()));
        // el error transitorio sigue pendiente: no hubo segundo intento
        assert_eq!(rec.fail.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let rec = Arc::new(Recorder::default());
        {
            let mut fail = rec.fail.lock().unwrap();
            for _ in 0..5 {
                fail.push(WriteError::Transient("down".into()));
            }
        }
        let w = RetryWriter::new(rec.clone(), fast().with_max_attempts(3));
        assert!(w.write_event(&Event::state("t1", State::Running)).await.is_err());
        assert_eq!(rec.fail.lock().unwrap().len(), 2);
    }
}
