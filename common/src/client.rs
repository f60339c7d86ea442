use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::api::{
    view_str, CancelTaskResponse, CreateTaskResponse, ErrorBody, ListNodesResponse,
    ListTasksRequest, ListTasksResponse, ServiceInfo, UpdateNodeResponse, WriteEventResponse,
};
use crate::config::RpcClientConfig;
use crate::events::Event;
use crate::node::Node;
use crate::task::{Task, View};
use crate::writer::{EventWriter, WriteError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Transport(e) => e.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Cliente HTTP del servidor: API TES más los endpoints internos
/// de eventos y nodos.
#[derive(Clone, Debug)]
pub struct Client {
    base: String,
    http: reqwest::Client,
    user: String,
    password: String,
}

impl Client {
    pub fn new(conf: &RpcClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(conf.timeout()).build()?;
        Ok(Client {
            base: conf.server_address.trim_end_matches('/').to_owned(),
            http,
            user: conf.user.clone(),
            password: conf.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        if self.password.is_empty() {
            req
        } else {
            req.basic_auth(&self.user, Some(&self.password))
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let resp = self.auth(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.message)
                .unwrap_or(text);
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn create_task(&self, task: &Task) -> Result<CreateTaskResponse, ClientError> {
        self.send(self.http.post(self.url("/v1/tasks")).json(task)).await
    }

    pub async fn get_task(&self, id: &str, view: View) -> Result<Task, ClientError> {
        let req = self
            .http
            .get(self.url(&format!("/v1/tasks/{id}")))
            .query(&[("view", view_str(view))]);
        self.send(req).await
    }

    pub async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse, ClientError> {
        let req = self.http.get(self.url("/v1/tasks")).query(&req.to_query());
        self.send(req).await
    }

    pub async fn cancel_task(&self, id: &str) -> Result<CancelTaskResponse, ClientError> {
        self.send(self.http.post(self.url(&format!("/v1/tasks/{id}:cancel"))))
            .await
    }

    pub async fn service_info(&self) -> Result<ServiceInfo, ClientError> {
        self.send(self.http.get(self.url("/v1/tasks/service-info"))).await
    }

    pub async fn write_event(&self, ev: &Event) -> Result<WriteEventResponse, ClientError> {
        self.send(self.http.post(self.url("/v1/events")).json(ev)).await
    }

    pub async fn get_node(&self, id: &str) -> Result<Node, ClientError> {
        self.send(self.http.get(self.url(&format!("/v1/nodes/{id}")))).await
    }

    pub async fn update_node(&self, node: &Node) -> Result<UpdateNodeResponse, ClientError> {
        let req = self
            .http
            .put(self.url(&format!("/v1/nodes/{}", node.id)))
            .json(node);
        self.send(req).await
    }

    pub async fn list_nodes(&self) -> Result<ListNodesResponse, ClientError> {
        self.send(self.http.get(self.url("/v1/nodes"))).await
    }
}

/// Writer que manda los eventos al servidor (EventService.WriteEvent).
#[derive(Clone, Debug)]
pub struct RpcWriter {
    client: Client,
}

impl RpcWriter {
    pub fn new(client: Client) -> Self {
        RpcWriter { client }
    }
}

#[async_trait]
impl EventWriter for RpcWriter {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        match self.client.write_event(ev).await {
            Ok(_) => Ok(()),
            Err(e) => Err(client_to_write_error(e)),
        }
    }
}

fn client_to_write_error(e: ClientError) -> WriteError {
    match e.status().and_then(|s| StatusCode::from_u16(s).ok()) {
        Some(StatusCode::NOT_FOUND) => WriteError::NotFound(e.to_string()),
        Some(StatusCode::BAD_REQUEST) => WriteError::InvalidArgument(e.to_string()),
        Some(s) if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            WriteError::Transient(e.to_string())
        }
        Some(_) => WriteError::Other(e.to_string()),
        // sin respuesta: conexión rechazada, timeout...
        None => WriteError::Transient(e.to_string()),
    }
}
