use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use common::config::{ComputeKind, Config};
use common::ids::IdGenerator;
use common::writer::{EventWriter, MultiWriter};

use crate::auth::Auth;
use crate::compute::{Builtin, ComputeBackend, Hpc, Noop};
use crate::store::MemoryStore;
use crate::writers::{build_sinks, StoreFanout};

/// Estado compartido por handlers, scheduler y reaper.
#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Config>,
    pub store: Arc<MemoryStore>,
    // writers secundarios (log, kafka, pubsub)
    pub sinks: Arc<MultiWriter>,
    // store + secundarios; toda escritura de eventos pasa por aquí
    pub writer: Arc<dyn EventWriter>,
    pub compute: Arc<dyn ComputeBackend>,
    pub auth: Arc<Auth>,
    pub ids: Arc<IdGenerator>,
    pub started_at: String,
}

impl AppState {
    pub fn new(conf: Config) -> anyhow::Result<Self> {
        let store = match &conf.server.db_path {
            Some(path) => MemoryStore::open(path, conf.server.max_executor_log_size)?,
            None => MemoryStore::new(conf.server.max_executor_log_size),
        };
        Self::with_store(conf, Arc::new(store))
    }

    pub fn with_store(conf: Config, store: Arc<MemoryStore>) -> anyhow::Result<Self> {
        let sinks = Arc::new(build_sinks(&conf)?);
        let writer: Arc<dyn EventWriter> = Arc::new(StoreFanout::new(store.clone(), sinks.clone()));

        let compute: Arc<dyn ComputeBackend> = match conf.compute {
            ComputeKind::Builtin => Arc::new(Builtin),
            ComputeKind::Noop => Arc::new(Noop),
            ComputeKind::Hpc => Arc::new(Hpc::new(conf.hpc.clone(), writer.clone())),
        };
        info!("backend de cómputo: {}", compute.name());

        let auth = Arc::new(Auth::from_config(&conf.server));
        if auth.enabled() {
            info!("autenticación activada");
        }

        Ok(AppState {
            conf: Arc::new(conf),
            store,
            sinks,
            writer,
            compute,
            auth,
            ids: Arc::new(IdGenerator::new()),
            started_at: common::events::timestamp(Utc::now()),
        })
    }
}
