use tracing_subscriber::EnvFilter;

use crate::config::LoggerConfig;

/// Inicializa tracing para un binario.
///
/// `defaults` es el filtro base (p.ej. `"funnel_server=debug,axum=info"`); `RUST_LOG`
/// tiene prioridad y el nivel configurado se aplica al resto de crates.
pub fn init(conf: &LoggerConfig, defaults: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{}", conf.level, defaults)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // try_init: en tests puede haber ya un subscriber global
    let _ = if conf.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
