use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

use common::api::ListTasksRequest;
use common::client::Client;
use common::config::{RpcClientConfig, BASIC_AUTH_USER, DEFAULT_SERVER_URL};
use common::{State, Task, View};

const WAIT_POLL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "funnel", about = "Cliente TES")]
pub struct Cli {
    /// Dirección del servidor
    #[arg(long, global = true, env = "FUNNEL_SERVER", default_value = DEFAULT_SERVER_URL)]
    server: String,

    #[arg(long, global = true, env = "FUNNEL_SERVER_USER", default_value = BASIC_AUTH_USER)]
    user: String,

    #[arg(long, global = true, env = "FUNNEL_SERVER_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Operaciones sobre tareas
    #[command(subcommand)]
    Task(TaskCmd),
}

#[derive(Subcommand, Debug)]
enum TaskCmd {
    /// Crea tareas a partir de ficheros JSON ("-" lee de stdin)
    Create {
        #[arg(required = true, value_name = "FICHERO")]
        files: Vec<PathBuf>,
    },
    /// Muestra tareas
    Get {
        #[arg(required = true, value_name = "TASK_ID")]
        ids: Vec<String>,
        #[arg(long, default_value = "BASIC")]
        view: View,
    },
    /// Lista tareas
    List {
        #[arg(long, default_value = "MINIMAL")]
        view: View,
        #[arg(long)]
        state: Option<State>,
        /// Filtro por tag, `clave=valor` o solo `clave`
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
        #[arg(long, default_value_t = 0)]
        page_size: i64,
        #[arg(long, default_value = "")]
        page_token: String,
        /// Sigue los tokens de página hasta el final
        #[arg(long)]
        all: bool,
    },
    /// Cancela tareas
    Cancel {
        #[arg(required = true, value_name = "TASK_ID")]
        ids: Vec<String>,
    },
    /// Espera a que terminen; falla si alguna no acaba en COMPLETE
    Wait {
        #[arg(required = true, value_name = "TASK_ID")]
        ids: Vec<String>,
    },
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    let (k, v) = raw.split_once('=').unwrap_or((raw, ""));
    if k.is_empty() {
        return Err(format!("tag sin clave: {raw}"));
    }
    Ok((k.to_string(), v.to_string()))
}

async fn read_task(path: &PathBuf) -> Result<Task> {
    let raw = if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        buf
    } else {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("leyendo {}", path.display()))?
    };
    serde_json::from_slice(&raw).with_context(|| format!("tarea inválida en {}", path.display()))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new(&RpcClientConfig {
        server_address: cli.server.clone(),
        user: cli.user.clone(),
        password: cli.password.clone(),
        ..Default::default()
    })?;
    debug!("servidor: {}", client.base_url());

    let Commands::Task(cmd) = cli.command;
    match cmd {
        TaskCmd::Create { files } => {
            for f in &files {
                let task = read_task(f).await?;
                let resp = client.create_task(&task).await?;
                println!("{}", resp.id);
            }
        }
        TaskCmd::Get { ids, view } => {
            for id in &ids {
                print_json(&client.get_task(id, view).await?)?;
            }
        }
        TaskCmd::List {
            view,
            state,
            tags,
            page_size,
            page_token,
            all,
        } => {
            let mut req = ListTasksRequest {
                page_size,
                page_token,
                view,
                state,
                tags: tags.into_iter().collect::<BTreeMap<_, _>>(),
            };
            if !all {
                print_json(&client.list_tasks(&req).await?)?;
                return Ok(());
            }
            let mut tasks = Vec::new();
            loop {
                let page = client.list_tasks(&req).await?;
                tasks.extend(page.tasks);
                if page.next_page_token.is_empty() {
                    break;
                }
                req.page_token = page.next_page_token;
            }
            print_json(&serde_json::json!({ "tasks": tasks }))?;
        }
        TaskCmd::Cancel { ids } => {
            for id in &ids {
                client.cancel_task(id).await?;
                println!("{id}");
            }
        }
        TaskCmd::Wait { ids } => {
            let mut failed = Vec::new();
            for id in &ids {
                let state = wait(&client, id).await?;
                if state != State::Complete {
                    failed.push(format!("{id}: {state}"));
                }
            }
            if !failed.is_empty() {
                bail!("tareas sin completar: {}", failed.join(", "));
            }
        }
    }
    Ok(())
}

async fn wait(client: &Client, id: &str) -> Result<State> {
    loop {
        let task = client.get_task(id, View::Minimal).await?;
        if task.state.is_terminal() {
            return Ok(task.state);
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_with_and_without_values() {
        assert_eq!(parse_tag("a=1").unwrap(), ("a".into(), "1".into()));
        assert_eq!(parse_tag("a").unwrap(), ("a".into(), String::new()));
        assert_eq!(parse_tag("x=y=z").unwrap(), ("x".into(), "y=z".into()));
        assert!(parse_tag("=1").is_err());
    }

    #[test]
    fn list_flags_parse() {
        let cli = Cli::try_parse_from([
            "funnel", "--server", "http://h:9", "task", "list", "--state", "running", "--tag",
            "project=x", "--all",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://h:9");
        match cli.command {
            Commands::Task(TaskCmd::List { state, tags, all, view, .. }) => {
                assert_eq!(state, Some(State::Running));
                assert_eq!(tags, vec![("project".to_string(), "x".to_string())]);
                assert!(all);
                assert_eq!(view, View::Minimal);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn get_needs_an_id() {
        assert!(Cli::try_parse_from(["funnel", "task", "get"]).is_err());
    }
}
