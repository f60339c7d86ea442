use async_trait::async_trait;

use super::{EventWriter, WriteError};
use crate::events::{Event, Level, Payload};

/// Descarta system logs por debajo de `min`; el resto pasa sin tocar.
pub struct SystemLogFilter<W> {
    inner: W,
    min: Level,
}

impl<W: EventWriter> SystemLogFilter<W> {
    pub fn new(inner: W, min: Level) -> Self {
        SystemLogFilter { inner, min }
    }
}

#[async_trait]
impl<W: EventWriter> EventWriter for SystemLogFilter<W> {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        if let Payload::SystemLog(sl) = &ev.payload {
            if Level::parse(&sl.level) < self.min {
                return Ok(());
            }
        }
        self.inner.write_event(ev).await
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
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn drops_below_threshold() {
        let rec = Arc::new(Recorder::default());
        let w = SystemLogFilter::new(rec.clone(), Level::Info);
        for level in [Level::Debug, Level::Info, Level::Error] {
            w.write_event(&Event::system_log("t1", 0, 0, level, "m", BTreeMap::new()))
                .await
                .unwrap();
        }
        w.write_event(&Event::state("t1", State::Running)).await.unwrap();

        let events = rec.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| match &e.payload {
            Payload::SystemLog(sl) => sl.level != "debug",
            _ => true,
        }));
    }
}
