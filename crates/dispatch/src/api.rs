//! Control-plane records and the client contract.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle states of a container record. Transitions are owned by the
/// control plane; a dispatcher may request Queued -> Locked (lock) and
/// Locked -> Queued (unlock).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    Queued,
    Locked,
    Running,
    Complete,
    Cancelled,
}

impl ContainerState {
    /// True for states that no runner should be started (or kept) for.
    pub fn is_final(self) -> bool {
        matches!(self, ContainerState::Complete | ContainerState::Cancelled)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerState::Queued => "Queued",
            ContainerState::Locked => "Locked",
            ContainerState::Running => "Running",
            ContainerState::Complete => "Complete",
            ContainerState::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// A container record as returned by the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Container {
    pub uuid: String,
    pub state: ContainerState,
    #[serde(default)]
    pub priority: i64,
    /// Authorization UUID of the dispatcher holding the lock, if any.
    /// The wire encodes "no owner" as an empty string.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub locked_by_uuid: Option<String>,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// The dispatcher's own identity at the control plane.
#[derive(Clone, Debug, Deserialize)]
pub struct Authorization {
    pub uuid: String,
}

/// One page of a container listing.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContainerPage {
    pub items: Vec<Container>,
    /// Total records matching the query, across all pages.
    #[serde(default)]
    pub items_available: usize,
}

/// A `[attribute, operator, operand]` query filter, serialized as a JSON
/// triple.
#[derive(Clone, Debug, Serialize)]
pub struct Filter(pub String, pub String, pub serde_json::Value);

impl Filter {
    pub fn eq(attr: &str, value: impl Into<serde_json::Value>) -> Self {
        Self(attr.to_string(), "=".to_string(), value.into())
    }

    pub fn gt(attr: &str, value: impl Into<serde_json::Value>) -> Self {
        Self(attr.to_string(), ">".to_string(), value.into())
    }

    pub fn within(attr: &str, values: Vec<String>) -> Self {
        Self(
            attr.to_string(),
            "in".to_string(),
            serde_json::Value::from(values),
        )
    }
}

/// The polled record store supplying container and authorization records.
///
/// `list_containers` returns records ordered by descending priority and is
/// paginated by `offset`; callers keep fetching until a page comes back
/// short.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn current_authorization(&self) -> Result<Authorization>;

    async fn list_containers(&self, filters: &[Filter], offset: usize) -> Result<ContainerPage>;

    async fn get_container(&self, uuid: &str) -> Result<Container>;

    /// Request Queued -> Locked for this dispatcher. Fails if another
    /// dispatcher got there first.
    async fn lock(&self, uuid: &str) -> Result<()>;

    /// Request Locked -> Queued, releasing this dispatcher's claim.
    async fn unlock(&self, uuid: &str) -> Result<()>;

    async fn update_state(&self, uuid: &str, state: ContainerState) -> Result<()>;
}
