//! Worker TES: ejecuta tareas en contenedores y el bucle de nodo.

pub mod container;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod node;
pub mod reader;
pub mod step;
pub mod storage;
pub mod tail;
pub mod transfer;
pub mod util;

use std::sync::Arc;

use common::client::{Client, RpcWriter};
use common::config::Config;
use common::writer::{
    EventWriter, LogWriter, MultiWriter, RetryPolicy, RetryWriter, SystemLogFilter,
};

/// Eventos al servidor (con reintentos) y al log local, sin los system logs
/// por debajo de `worker.system_log_level`.
pub fn build_writer(conf: &Config, client: Client) -> Arc<dyn EventWriter> {
    let policy = RetryPolicy::default().with_max_attempts(conf.rpc_client.max_retries);
    let chain = MultiWriter::new(vec![
        Arc::new(RetryWriter::new(RpcWriter::new(client), policy)),
        Arc::new(LogWriter),
    ]);
    Arc::new(SystemLogFilter::new(chain, conf.worker.system_log_level))
}
