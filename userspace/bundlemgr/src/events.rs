// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bundle status events published to other processes.

use parking_lot::Mutex;

/// Kind of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A bundle was installed.
    PackageAdded,
    /// A bundle or module was removed.
    PackageRemoved,
    /// A bundle was updated or its enablement changed.
    PackageChanged,
}

/// Operation a notification reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyType {
    /// Bundle installed.
    Install,
    /// Bundle updated.
    Update,
    /// Whole bundle uninstalled.
    UninstallBundle,
    /// One module uninstalled.
    UninstallModule,
    /// Ability enablement changed.
    AbilityEnable,
    /// Application enablement changed.
    ApplicationEnable,
}

/// Callback flavour delivered to status subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallType {
    /// Install, update or enablement change.
    InstallCallback,
    /// Bundle or module removal.
    UninstallCallback,
}

impl NotifyType {
    /// Event published for this notification.
    pub fn event_kind(self) -> EventKind {
        match self {
            NotifyType::Install => EventKind::PackageAdded,
            NotifyType::UninstallBundle | NotifyType::UninstallModule => EventKind::PackageRemoved,
            NotifyType::Update | NotifyType::AbilityEnable | NotifyType::ApplicationEnable => {
                EventKind::PackageChanged
            }
        }
    }

    /// Callback flavour for this notification.
    pub fn install_type(self) -> InstallType {
        match self {
            NotifyType::UninstallBundle | NotifyType::UninstallModule => {
                InstallType::UninstallCallback
            }
            _ => InstallType::InstallCallback,
        }
    }
}

/// Event handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Bundle concerned.
    pub bundle_name: String,
    /// Module concerned, may be empty.
    pub module_name: String,
    /// Ability concerned, may be empty.
    pub ability_name: String,
    /// Uid of the bundle for the affected user.
    pub uid: i32,
    /// User derived from `uid`.
    pub user_id: i32,
}

/// Delivery of bundle events to other processes.
pub trait EventSink: Send + Sync {
    /// Publishes one event.
    fn publish(&self, event: BundleEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: BundleEvent) {}
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<BundleEvent>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<BundleEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: BundleEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_type_mapping() {
        use NotifyType::*;
        assert_eq!(Install.event_kind(), EventKind::PackageAdded);
        assert_eq!(UninstallBundle.event_kind(), EventKind::PackageRemoved);
        assert_eq!(UninstallModule.event_kind(), EventKind::PackageRemoved);
        for kind in [Update, AbilityEnable, ApplicationEnable] {
            assert_eq!(kind.event_kind(), EventKind::PackageChanged);
            assert_eq!(kind.install_type(), InstallType::InstallCallback);
        }
        assert_eq!(UninstallModule.install_type(), InstallType::UninstallCallback);
    }
}
