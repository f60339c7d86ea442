//! Cadena de writers del servidor según `event_writers` de la config.

use anyhow::Context as _;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use common::config::{Config, WriterKind};
use common::writer::{
    BusWriter, EventWriter, KafkaRestPublisher, LogWriter, MultiWriter, PubSubPublisher,
    RetryPolicy, RetryWriter, WriteError,
};
use common::Event;

use crate::store::MemoryStore;

/// Writers secundarios (todo menos el store) en el orden configurado.
pub fn build_sinks(conf: &Config) -> anyhow::Result<MultiWriter> {
    let policy = RetryPolicy::default().with_max_attempts(conf.rpc_client.max_retries.max(1));
    let mut sinks = MultiWriter::default();

    for kind in &conf.event_writers {
        match kind {
            WriterKind::Storage => {}
            WriterKind::Log => sinks.push(Arc::new(LogWriter)),
            WriterKind::Kafka => {
                let k = &conf.kafka;
                if k.rest_url.is_empty() || k.topic.is_empty() {
                    anyhow::bail!("writer kafka sin kafka.rest_url o kafka.topic");
                }
                let publisher = KafkaRestPublisher::new(&k.rest_url, &k.topic)
                    .map_err(anyhow::Error::from)
                    .context("configurando writer kafka")?;
                let w = BusWriter::new(publisher).include_logs(k.include_logs);
                sinks.push(Arc::new(RetryWriter::new(w, policy)));
                info!("writer kafka activo: {}/topics/{}", k.rest_url, k.topic);
            }
            WriterKind::PubSub => {
                let p = &conf.pubsub;
                if p.project.is_empty() || p.topic.is_empty() {
                    anyhow::bail!("writer pubsub sin pubsub.project o pubsub.topic");
                }
                let publisher = PubSubPublisher::new(&p.endpoint, &p.project, &p.topic, &p.token)
                    .map_err(anyhow::Error::from)
                    .context("configurando writer pubsub")?;
                let w = BusWriter::new(publisher).include_logs(p.include_logs);
                sinks.push(Arc::new(RetryWriter::new(w, policy)));
                info!("writer pubsub activo: {}/{}", p.project, p.topic);
            }
        }
    }
    Ok(sinks)
}

/// Escribe primero en el store y después en los writers secundarios.
///
/// Solo el error del store llega al llamante; el de los secundarios se registra.
pub struct StoreFanout {
    store: Arc<MemoryStore>,
    sinks: Arc<MultiWriter>,
}

impl StoreFanout {
    pub fn new(store: Arc<MemoryStore>, sinks: Arc<MultiWriter>) -> Self {
        StoreFanout { store, sinks }
    }
}

#[async_trait]
impl EventWriter for StoreFanout {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        self.store.write_event(ev).await?;
        if let Err(e) = self.sinks.write_event(ev).await {
            warn!(task_id = %ev.id, kind = %ev.kind, "writer secundario falló: {e}");
        }
        Ok(())
    }

    async fn close(&self) {
        self.sinks.close().await
    }
}
