use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::events::Level;

/// Endpoint por defecto de clientes y workers.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
/// Usuario fijo de la autenticación básica vía `FUNNEL_SERVER_PASSWORD`.
pub const BASIC_AUTH_USER: &str = "funnel";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub rpc_client: RpcClientConfig,
    pub scheduler: SchedulerConfig,
    pub node: NodeConfig,
    pub worker: WorkerConfig,
    pub logger: LoggerConfig,
    pub compute: ComputeKind,
    pub event_writers: Vec<WriterKind>,
    pub kafka: KafkaConfig,
    pub pubsub: PubSubConfig,
    pub hpc: HpcConfig,
    pub local_storage: LocalStorageConfig,
    pub http_storage: HttpStorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            rpc_client: RpcClientConfig::default(),
            scheduler: SchedulerConfig::default(),
            node: NodeConfig::default(),
            worker: WorkerConfig::default(),
            logger: LoggerConfig::default(),
            compute: ComputeKind::Builtin,
            event_writers: vec![WriterKind::Storage, WriterKind::Log],
            kafka: KafkaConfig::default(),
            pubsub: PubSubConfig::default(),
            hpc: HpcConfig::default(),
            local_storage: LocalStorageConfig::default(),
            http_storage: HttpStorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeKind {
    Builtin,
    Noop,
    Hpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterKind {
    Storage,
    Log,
    Kafka,
    PubSub,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host_name: String,
    pub http_port: u16,
    pub service_name: String,
    pub organization_name: String,
    pub organization_url: String,
    /// Tamaño máximo de stdout/stderr por executor en el store.
    pub max_executor_log_size: usize,
    /// Diario de eventos (JSON por línea). Vacío = solo memoria.
    pub db_path: Option<PathBuf>,
    pub basic_auth: Vec<BasicCredential>,
    pub oidc: OidcConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host_name: "localhost".into(),
            http_port: 8000,
            service_name: "Funnel".into(),
            organization_name: "Funnel".into(),
            organization_url: "https://ohsu-comp-bio.github.io/funnel".into(),
            max_executor_log_size: 10_000,
            db_path: None,
            basic_auth: Vec::new(),
            oidc: OidcConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn http_address(&self) -> String {
        format!("http://{}:{}", self.host_name, self.http_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicCredential {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// URL del documento JWKS. Vacío = OIDC desactivado.
    pub jwks_url: String,
    pub issuer: String,
    pub audience: Vec<String>,
    pub required_scopes: Vec<String>,
    pub introspection_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl OidcConfig {
    pub fn enabled(&self) -> bool {
        !self.jwks_url.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    pub server_address: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        RpcClientConfig {
            server_address: DEFAULT_SERVER_URL.into(),
            user: String::new(),
            password: String::new(),
            timeout_secs: 60,
            max_retries: 10,
        }
    }
}

impl RpcClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub schedule_rate_ms: u64,
    pub schedule_chunk: usize,
    pub node_ping_timeout_secs: u64,
    pub node_init_timeout_secs: u64,
    pub node_dead_timeout_secs: u64,
    /// Peso por nombre de score; un score ausente pesa 1.
    pub score_weights: BTreeMap<String, f64>,
    /// Etiquetas que un nodo debe tener en `metadata` para recibir tareas.
    pub node_tags: Vec<String>,
    /// Comando (`sh -c`) para arrancar nodos UNINITIALIZED; admite
    /// `{{node_id}}` y `{{zone}}`. Vacío = sin autoescalado.
    pub scaler_command: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            schedule_rate_ms: 1000,
            schedule_chunk: 10,
            node_ping_timeout_secs: 60,
            node_init_timeout_secs: 300,
            node_dead_timeout_secs: 300,
            score_weights: BTreeMap::new(),
            node_tags: Vec::new(),
            scaler_command: String::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn schedule_rate(&self) -> Duration {
        Duration::from_millis(self.schedule_rate_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Vacío = se genera uno al arrancar.
    pub id: String,
    /// Segundos sin tareas antes de apagarse; negativo = nunca.
    pub timeout_secs: i64,
    pub update_rate_ms: u64,
    pub shutdown_grace_secs: u64,
    /// Recursos a declarar; cero = detectar en el host.
    pub cpus: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
    pub zone: String,
    pub preemptible: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: String::new(),
            timeout_secs: -1,
            update_rate_ms: 5000,
            shutdown_grace_secs: 10,
            cpus: 0,
            ram_gb: 0.0,
            disk_gb: 0.0,
            zone: String::new(),
            preemptible: false,
            metadata: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn update_rate(&self) -> Duration {
        Duration::from_millis(self.update_rate_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_secs).ok().map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub work_dir: PathBuf,
    pub leave_work_dir: bool,
    pub max_parallel_transfers: usize,
    pub polling_rate_ms: u64,
    pub log_update_rate_ms: u64,
    pub log_tail_size: usize,
    /// Comando base del runtime de contenedores.
    pub container_driver: Vec<String>,
    /// Nivel mínimo de los system logs que salen del worker.
    pub system_log_level: Level,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            work_dir: PathBuf::from("./funnel-work-dir"),
            leave_work_dir: false,
            max_parallel_transfers: 10,
            polling_rate_ms: 5000,
            log_update_rate_ms: 5000,
            log_tail_size: 10_000,
            container_driver: vec!["docker".into()],
            system_log_level: Level::Debug,
        }
    }
}

impl WorkerConfig {
    pub fn polling_rate(&self) -> Duration {
        Duration::from_millis(self.polling_rate_ms)
    }

    pub fn log_update_rate(&self) -> Duration {
        Duration::from_millis(self.log_update_rate_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    /// "text" o "json".
    pub format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Base del Kafka REST proxy, p.ej. http://kafka-rest:8082
    pub rest_url: String,
    pub topic: String,
    pub include_logs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub endpoint: String,
    pub project: String,
    pub topic: String,
    pub token: String,
    pub include_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HpcConfig {
    /// Plantilla del comando de envío; se ejecuta con `sh -c`.
    pub submit_template: String,
    pub cancel_template: String,
    pub worker_command: String,
}

impl Default for HpcConfig {
    fn default() -> Self {
        HpcConfig {
            submit_template: String::new(),
            cancel_template: String::new(),
            worker_command: "funnel-worker run --task-id {{task_id}}".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    pub disabled: bool,
    /// Directorios permitidos; vacío = cualquiera.
    pub allowed_dirs: Vec<PathBuf>,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        LocalStorageConfig {
            disabled: false,
            allowed_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStorageConfig {
    pub disabled: bool,
    pub timeout_secs: u64,
}

impl Default for HttpStorageConfig {
    fn default() -> Self {
        HttpStorageConfig {
            disabled: false,
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// Capas: defaults -> TOML opcional -> variables `FUNNEL_SECCION__CAMPO`.
    /// `FUNNEL_SERVER`, `FUNNEL_SERVER_USER` y `FUNNEL_SERVER_PASSWORD` van aparte.
    pub fn load(path: Option<&Path>) -> Result<Config, figment::Error> {
        let mut fig = Figment::from(Serialized::defaults(Config::default()));
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FUNNEL_CONFIG").map(PathBuf::from));
        if let Some(p) = path {
            fig = fig.merge(Toml::file(p));
        }
        fig = fig.merge(
            Env::prefixed("FUNNEL_")
                .filter(|k| !is_well_known(&k.as_str().to_ascii_lowercase()))
                .map(|k| k.as_str().replace("__", ".").into()),
        );
        let mut conf: Config = fig.extract()?;
        conf.apply_well_known_env(|k| std::env::var(k).ok());
        Ok(conf)
    }

    /// Variables históricas sin sección.
    pub fn apply_well_known_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(password) = get("FUNNEL_SERVER_PASSWORD").filter(|p| !p.is_empty()) {
            let cred = BasicCredential {
                user: BASIC_AUTH_USER.into(),
                password: password.clone(),
            };
            if !self.server.basic_auth.contains(&cred) {
                self.server.basic_auth.push(cred);
            }
            if self.rpc_client.password.is_empty() {
                self.rpc_client.user = BASIC_AUTH_USER.into();
                self.rpc_client.password = password;
            }
        }
        if let Some(user) = get("FUNNEL_SERVER_USER").filter(|u| !u.is_empty()) {
            self.rpc_client.user = user;
        }
        if let Some(server) = get("FUNNEL_SERVER").filter(|s| !s.is_empty()) {
            self.rpc_client.server_address = server;
        }
    }
}

fn is_well_known(key: &str) -> bool {
    matches!(key, "server" | "server_password" | "server_user" | "config")
}
