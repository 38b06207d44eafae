//! Test doubles: an in-memory control plane and a recording runner.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use cairn_dispatch::api::{
    Authorization, Container, ContainerPage, ContainerState, ControlPlane, Filter,
};
use cairn_dispatch::dispatcher::RunnerFn;
use cairn_dispatch::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DISPATCHER_AUTH: &str = "zzzzz-gj3su-dispatcher000001";
pub const OTHER_AUTH: &str = "zzzzz-gj3su-otherdispatcher1";

/// In-memory container table implementing the control plane contract.
pub struct StubControlPlane {
    auth: String,
    containers: Mutex<BTreeMap<String, Container>>,
    pub lock_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub fail_lock: AtomicBool,
    pub fail_lists: AtomicBool,
    page_size: usize,
}

impl StubControlPlane {
    pub fn new() -> Self {
        Self {
            auth: DISPATCHER_AUTH.to_string(),
            containers: Mutex::new(BTreeMap::new()),
            lock_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            fail_lock: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            page_size: 2,
        }
    }

    pub fn insert(&self, container: Container) {
        self.containers
            .lock()
            .unwrap()
            .insert(container.uuid.clone(), container);
    }

    pub fn set_state(&self, uuid: &str, state: ContainerState, locked_by: Option<&str>) {
        let mut containers = self.containers.lock().unwrap();
        let c = containers.get_mut(uuid).expect("no such container");
        c.state = state;
        c.locked_by_uuid = locked_by.map(|s| s.to_string());
    }

    pub fn remove(&self, uuid: &str) {
        self.containers.lock().unwrap().remove(uuid);
    }

    pub fn state_of(&self, uuid: &str) -> Option<ContainerState> {
        self.containers.lock().unwrap().get(uuid).map(|c| c.state)
    }

    fn matches(container: &Container, filter: &Filter) -> bool {
        match (filter.0.as_str(), filter.1.as_str()) {
            ("locked_by_uuid", "=") => {
                container.locked_by_uuid.as_deref().unwrap_or("")
                    == filter.2.as_str().unwrap_or("")
            }
            ("state", "=") => container.state.to_string() == filter.2.as_str().unwrap_or(""),
            ("priority", ">") => container.priority > filter.2.as_i64().unwrap_or(0),
            ("uuid", "in") => filter
                .2
                .as_array()
                .is_some_and(|values| values.iter().any(|v| v.as_str() == Some(&container.uuid))),
            _ => false,
        }
    }
}

#[async_trait]
impl ControlPlane for StubControlPlane {
    async fn current_authorization(&self) -> Result<Authorization> {
        Ok(Authorization {
            uuid: self.auth.clone(),
        })
    }

    async fn list_containers(&self, filters: &[Filter], offset: usize) -> Result<ContainerPage> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_lists.load(Ordering::Relaxed) {
            return Err(Error::Api {
                status: 500,
                message: "injected failure".to_string(),
            });
        }
        let containers = self.containers.lock().unwrap();
        let mut matched: Vec<Container> = containers
            .values()
            .filter(|c| filters.iter().all(|f| Self::matches(c, f)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.uuid.cmp(&b.uuid)));
        let items_available = matched.len();
        let items = matched
            .into_iter()
            .skip(offset)
            .take(self.page_size)
            .collect();
        Ok(ContainerPage {
            items,
            items_available,
        })
    }

    async fn get_container(&self, uuid: &str) -> Result<Container> {
        self.containers
            .lock()
            .unwrap()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::Api {
                status: 404,
                message: format!("no container {uuid}"),
            })
    }

    async fn lock(&self, uuid: &str) -> Result<()> {
        self.lock_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_lock.load(Ordering::Relaxed) {
            return Err(Error::Api {
                status: 422,
                message: "injected lock failure".to_string(),
            });
        }
        let mut containers = self.containers.lock().unwrap();
        let c = containers.get_mut(uuid).ok_or_else(|| Error::Api {
            status: 404,
            message: format!("no container {uuid}"),
        })?;
        if c.state != ContainerState::Queued || c.locked_by_uuid.is_some() {
            return Err(Error::Api {
                status: 422,
                message: format!("container {uuid} is not lockable"),
            });
        }
        c.state = ContainerState::Locked;
        c.locked_by_uuid = Some(self.auth.clone());
        Ok(())
    }

    async fn unlock(&self, uuid: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        if let Some(c) = containers.get_mut(uuid) {
            c.state = ContainerState::Queued;
            c.locked_by_uuid = None;
        }
        Ok(())
    }

    async fn update_state(&self, uuid: &str, state: ContainerState) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers.get_mut(uuid).ok_or_else(|| Error::Api {
            status: 404,
            message: format!("no container {uuid}"),
        })?;
        c.state = state;
        Ok(())
    }
}

pub fn queued_container(uuid: &str, priority: i64) -> Container {
    Container {
        uuid: uuid.to_string(),
        state: ContainerState::Queued,
        priority,
        locked_by_uuid: None,
    }
}

/// Collects everything the runners observe.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<(String, ContainerState)>>,
    pub closed: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events_for(&self, uuid: &str) -> Vec<ContainerState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == uuid)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn closed_count(&self, uuid: &str) -> usize {
        self.closed.lock().unwrap().iter().filter(|u| *u == uuid).count()
    }
}

/// A runner that records the states it receives and when its mailbox
/// closes.
pub fn recording_runner(recorder: Arc<Recorder>) -> RunnerFn {
    Arc::new(move |_dispatcher, container, updates| {
        let recorder = recorder.clone();
        Box::pin(async move {
            let mut updates = updates;
            let initial = updates.borrow_and_update().clone();
            recorder
                .events
                .lock()
                .unwrap()
                .push((initial.uuid.clone(), initial.state));
            while updates.changed().await.is_ok() {
                let current = updates.borrow_and_update().clone();
                recorder
                    .events
                    .lock()
                    .unwrap()
                    .push((current.uuid.clone(), current.state));
            }
            recorder.closed.lock().unwrap().push(container.uuid.clone());
        })
    })
}

/// Let spawned runner tasks make progress.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
