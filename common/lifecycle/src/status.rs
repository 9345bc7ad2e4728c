use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

/// Coarse lifecycle state of a subscription, as seen by supervising code.
///
/// A subscription moves `Starting -> Up` once it is connected and polling,
/// and ends in either `Down` (clean exit) or `Error` (fatal stop). The error
/// reason is kept so whoever watches the status can alert or restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleStatus {
    Starting,
    Up,
    Error { reason: String },
    Down,
}

impl LifecycleStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, LifecycleStatus::Error { .. })
    }

    pub fn is_up(&self) -> bool {
        matches!(self, LifecycleStatus::Up)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStatus::Starting => write!(f, "starting"),
            LifecycleStatus::Up => write!(f, "up"),
            LifecycleStatus::Error { reason } => write!(f, "error: {reason}"),
            LifecycleStatus::Down => write!(f, "down"),
        }
    }
}

/// Receives lifecycle transitions for named components.
#[cfg_attr(test, mockall::automock)]
pub trait StatusSink: Send + Sync {
    fn report(&self, component: &str, status: LifecycleStatus);
}

/// Per-component reporting handle. Cheap to clone; remembers the last status
/// it reported so the runner can avoid overwriting an error with `Down`.
#[derive(Clone)]
pub struct StatusReporter {
    component: String,
    sink: Arc<dyn StatusSink>,
    last: Arc<Mutex<Option<LifecycleStatus>>>,
}

impl StatusReporter {
    pub fn new(component: impl Into<String>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            component: component.into(),
            sink,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn report(&self, status: LifecycleStatus) {
        {
            let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            if last.as_ref() == Some(&status) {
                return;
            }
            *last = Some(status.clone());
        }
        self.sink.report(&self.component, status);
    }

    /// Last status reported through this handle (or any of its clones),
    /// `Starting` if nothing was reported yet.
    pub fn current(&self) -> LifecycleStatus {
        self.last
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or(LifecycleStatus::Starting)
    }

    /// Reason attached to the last `Error` status, if the component is in error.
    pub fn last_error(&self) -> Option<String> {
        match self.current() {
            LifecycleStatus::Error { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Default, Debug)]
pub struct RegistryStatus {
    /// True if every registered component is up
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, LifecycleStatus>,
}

/// Aggregates the lifecycle status of several subscriptions running in one
/// process. The process is healthy only when at least one component is
/// registered and all of them are `Up`.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, LifecycleStatus>>>,
}

impl StatusRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in `Starting` and returns its reporting handle.
    pub fn register(&self, component: impl Into<String>) -> StatusReporter {
        let component = component.into();
        self.report(&component, LifecycleStatus::Starting);
        StatusReporter::new(component, Arc::new(self.clone()))
    }

    pub fn status_of(&self, component: &str) -> Option<LifecycleStatus> {
        self.components
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(component)
            .cloned()
    }

    pub fn get_status(&self) -> RegistryStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let healthy = !components.is_empty() && components.values().all(LifecycleStatus::is_up);

        match healthy {
            true => info!("{} status check ok", self.name),
            false => warn!("{} status check failed: {:?}", self.name, components),
        }
        RegistryStatus {
            healthy,
            components,
        }
    }
}

impl StatusSink for StatusRegistry {
    fn report(&self, component: &str, status: LifecycleStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(component.to_owned(), status);
            }
            Err(_) => {
                // Poisoned lock: the status check reads through the poison
                warn!("poisoned StatusRegistry lock")
            }
        }
    }
}
