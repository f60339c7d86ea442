//! Operaciones TES sobre el estado del servidor.

use tracing::{info, warn};

use common::api::{
    CancelTaskResponse, CreateTaskResponse, ListTasksRequest, ListTasksResponse, Organization,
    ServiceInfo, ServiceType,
};
use common::events::fields;
use common::validate::validate;
use common::writer::TaskEvents;
use common::{Event, State, Task, View};

use crate::error::ApiResult;
use crate::state::AppState;
use crate::store::TaskStore;

pub const SERVICE_ID: &str = "org.ga4gh.funnel";
pub const TES_VERSION: &str = "1.1.0";

impl AppState {
    /// Valida, asigna id, emite TASK_CREATED y despacha al backend.
    ///
    /// Una tarea inválida no consume id ni genera eventos. Si el despacho
    /// falla la tarea queda en SYSTEM_ERROR y se devuelve igualmente su id.
    pub async fn create_task(&self, mut task: Task) -> ApiResult<CreateTaskResponse> {
        validate(&task)?;

        let id = self.ids.next_id();
        task.id = id.clone();
        task.state = State::Queued;
        task.logs.clear();
        task.creation_time.clear();

        self.writer.write_event(&Event::created(task.clone())).await?;
        info!(task_id = %id, "tarea creada: {} executors", task.executors.len());

        if let Err(e) = self.compute.submit(&task).await {
            warn!(task_id = %id, "no se pudo despachar la tarea: {e}");
            let events = TaskEvents::new(id.clone(), 0, self.writer.clone());
            events
                .error("task dispatch failed", fields([("error", e.to_string())]))
                .await;
            events.state(State::SystemError).await;
        }
        Ok(CreateTaskResponse { id })
    }

    pub async fn get_task(&self, id: &str, view: View) -> ApiResult<Task> {
        Ok(self.store.get_task(id, view).await?)
    }

    pub async fn list_tasks(&self, req: &ListTasksRequest) -> ApiResult<ListTasksResponse> {
        Ok(self.store.list_tasks(req).await?)
    }

    /// Cancelar una tarea terminada no hace nada.
    pub async fn cancel_task(&self, id: &str) -> ApiResult<CancelTaskResponse> {
        let task = self.store.get_task(id, View::Minimal).await?;
        if task.state.is_terminal() {
            return Ok(CancelTaskResponse {});
        }
        self.writer
            .write_event(&Event::state(id, State::Canceled))
            .await?;
        info!(task_id = %id, "tarea cancelada");

        if let Err(e) = self.compute.cancel(id).await {
            warn!(task_id = %id, "el backend no pudo cancelar la tarea: {e}");
        }
        Ok(CancelTaskResponse {})
    }

    pub fn service_info(&self) -> ServiceInfo {
        let srv = &self.conf.server;
        ServiceInfo {
            id: SERVICE_ID.into(),
            name: srv.service_name.clone(),
            kind: ServiceType {
                group: "org.ga4gh".into(),
                artifact: "tes".into(),
                version: TES_VERSION.into(),
            },
            description: "Funnel is a toolkit for distributed task execution via a simple, standard API.".into(),
            organization: Organization {
                name: srv.organization_name.clone(),
                url: srv.organization_url.clone(),
            },
            version: env!("CARGO_PKG_VERSION").into(),
            storage: self.storage_uris(),
            created_at: self.started_at.clone(),
            updated_at: self.started_at.clone(),
        }
    }

    fn storage_uris(&self) -> Vec<String> {
        let mut out = Vec::new();
        let local = &self.conf.local_storage;
        if !local.disabled {
            if local.allowed_dirs.is_empty() {
                out.push("file:///".to_string());
            } else {
                out.extend(
                    local
                        .allowed_dirs
                        .iter()
                        .map(|d| format!("file://{}", d.display())),
                );
            }
        }
        if !self.conf.http_storage.disabled {
            out.push("http://".into());
            out.push("https://".into());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::Config;
    use common::Executor;

    fn hello() -> Task {
        Task {
            name: "hello".into(),
            executors: vec![Executor {
                image: "alpine".into(),
                command: vec!["echo".into(), "hello world".into()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_cancel() {
        let state = AppState::new(Config::default()).unwrap();
        let id = state.create_task(hello()).await.unwrap().id;
        assert_eq!(state.get_task(&id, View::Minimal).await.unwrap().state, State::Queued);

        state.cancel_task(&id).await.unwrap();
        assert_eq!(state.get_task(&id, View::Minimal).await.unwrap().state, State::Canceled);
        // segunda vez: no-op
        state.cancel_task(&id).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_task_emits_nothing() {
        let state = AppState::new(Config::default()).unwrap();
        let mut t = hello();
        t.executors[0].command.clear();
        let err = state.create_task(t).await.unwrap_err();
        assert!(err.message().contains("Command: required, but empty"));
        let page = state.list_tasks(&ListTasksRequest::default()).await.unwrap();
        assert!(page.tasks.is_empty());
    }

    #[tokio::test]
    async fn failed_dispatch_still_returns_the_id() {
        let mut conf = Config::default();
        // sin plantilla de envío el backend hpc rechaza todo
        conf.compute = common::config::ComputeKind::Hpc;
        let state = AppState::new(conf).unwrap();

        let id = state.create_task(hello()).await.unwrap().id;
        let t = state.get_task(&id, View::Full).await.unwrap();
        assert_eq!(t.state, State::SystemError);
        assert!(t.logs[0].system_logs.iter().any(|l| l.contains("task dispatch failed")));
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let state = AppState::new(Config::default()).unwrap();
        let err = state.cancel_task("01HZZZZZZZZZZZZZZZZZZZZZZZ").await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn service_info_fields() {
        let state = AppState::new(Config::default()).unwrap();
        let info = state.service_info();
        assert_eq!(info.id, SERVICE_ID);
        assert_eq!(info.kind.artifact, "tes");
        assert!(info.storage.contains(&"file:///".to_string()));
    }
}
