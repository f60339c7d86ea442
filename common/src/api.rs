use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::node::Node;
use crate::task::{State, Task, View};

/* --------- TaskService --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelTaskResponse {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListTasksRequest {
    pub page_size: i64,
    pub page_token: String,
    pub view: View,
    pub state: Option<State>,
    /// Valor vacío = basta con que exista la clave.
    pub tags: BTreeMap<String, String>,
}

impl ListTasksRequest {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(state) = self.state {
            if task.state != state {
                return false;
            }
        }
        self.tags.iter().all(|(k, v)| match task.tags.get(k) {
            Some(actual) => v.is_empty() || actual == v,
            None => false,
        })
    }

    /// Pares `clave=valor` para la query HTTP de ListTasks.
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut q = vec![("view".to_string(), view_str(self.view).to_string())];
        if self.page_size > 0 {
            q.push(("page_size".into(), self.page_size.to_string()));
        }
        if !self.page_token.is_empty() {
            q.push(("page_token".into(), self.page_token.clone()));
        }
        if let Some(state) = self.state {
            q.push(("state".into(), state.to_string()));
        }
        for (k, v) in &self.tags {
            q.push(("tag_key".into(), k.clone()));
            q.push(("tag_value".into(), v.clone()));
        }
        q
    }
}

pub fn view_str(view: View) -> &'static str {
    match view {
        View::Minimal => "MINIMAL",
        View::Basic => "BASIC",
        View::Full => "FULL",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_page_token: String,
}

/* --------- ServiceInfo --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceType,
    pub description: String,
    pub organization: Organization,
    pub version: String,
    pub storage: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceType {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Organization {
    pub name: String,
    pub url: String,
}

/* --------- EventService / SchedulerService --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteEventResponse {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateNodeResponse {}

/// Cuerpo de error que devuelve el servidor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}
