use core::fmt;

use crate::sync::IrqMutex;

/// Kernel initialization status tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed(&'static str),
}

/// Kernel component status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentStatus {
    pub name: &'static str,
    pub status: InitStatus,
}

// Registered before the heap exists, so no Vec here.
pub const MAX_COMPONENTS: usize = 8;

struct StatusTable {
    components: [Option<ComponentStatus>; MAX_COMPONENTS],
}

static INIT_STATUS: IrqMutex<StatusTable> = IrqMutex::new(StatusTable {
    components: [None; MAX_COMPONENTS],
});

impl ComponentStatus {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            status: InitStatus::NotStarted,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, InitStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, InitStatus::Failed(_))
    }
}

/// Track kernel component initialization. Returns false when the table is full.
pub fn register_component(name: &'static str) -> bool {
    let mut table = INIT_STATUS.lock();
    if table.components.iter().flatten().any(|c| c.name == name) {
        return true;
    }
    match table.components.iter_mut().find(|slot| slot.is_none()) {
        Some(slot) => {
            *slot = Some(ComponentStatus::new(name));
            true
        }
        None => false,
    }
}

/// Update component status
pub fn update_component_status(name: &'static str, status: InitStatus) {
    let mut table = INIT_STATUS.lock();
    if let Some(comp) = table.components.iter_mut().flatten().find(|c| c.name == name) {
        comp.status = status;
    }
}

pub fn component_status(name: &str) -> Option<InitStatus> {
    INIT_STATUS
        .lock()
        .components
        .iter()
        .flatten()
        .find(|c| c.name == name)
        .map(|c| c.status)
}

/// Calls `f` for every registered component, in registration order.
pub fn for_each_status(mut f: impl FnMut(&ComponentStatus)) {
    let snapshot = INIT_STATUS.lock().components;
    snapshot.iter().flatten().for_each(|c| f(c));
}

/// Check if all components are initialized
pub fn all_components_ready() -> bool {
    let table = INIT_STATUS.lock();
    let mut registered = table.components.iter().flatten().peekable();
    registered.peek().is_some() && registered.all(|c| c.is_complete())
}

impl fmt::Display for InitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStatus::NotStarted => write!(f, "Not Started"),
            InitStatus::InProgress => write!(f, "In Progress"),
            InitStatus::Completed => write!(f, "Completed"),
            InitStatus::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(register_component("status-test"));
        assert_eq!(component_status("status-test"), Some(InitStatus::NotStarted));

        update_component_status("status-test", InitStatus::Failed("no frames"));
        let status = component_status("status-test").unwrap();
        assert!(ComponentStatus { name: "status-test", status }.is_failed());
        assert_eq!(status.to_string(), "Failed: no frames");

        update_component_status("status-test", InitStatus::Completed);
        assert_eq!(component_status("status-test"), Some(InitStatus::Completed));
        assert_eq!(component_status("never-registered"), None);
    }

    #[test]
    fn test_registration_is_idempotent() {
        assert!(register_component("twice"));
        assert!(register_component("twice"));
        let mut count = 0;
        for_each_status(|c| {
            if c.name == "twice" {
                count += 1;
            }
        });
        assert_eq!(count, 1);
    }
}
