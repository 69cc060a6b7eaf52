//! A scripted, in-memory [`RegistryCapability`] for tests.
//!
//! Modeled on the teacher's own test doubles for platform backends (nusb's
//! `hotplug.rs` unit tests build fake slabs of wakers rather than touching a
//! real `IONotificationPortRef`): the unit tests, the numbered scenarios, and
//! the `proptest` properties in this crate all drive a [`FakeRegistry`]
//! instead of real IOKit, since this crate only builds its OS backend on
//! macOS.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::registry::{
    MatchDict, NotificationKind, NotificationPortHandle, PropertyValue, RegistryCapability,
    ServiceHandle,
};

struct FakeService {
    class_name: String,
    properties: HashMap<String, PropertyValue>,
    present: bool,
}

struct PortState {
    subscriptions: Vec<(NotificationKind, MatchDict)>,
    pending: HashMap<NotificationKind, Vec<ServiceHandle>>,
}

impl PortState {
    fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            pending: HashMap::new(),
        }
    }
}

struct State {
    services: HashMap<ServiceHandle, FakeService>,
    next_service: u64,
    ports: HashMap<NotificationPortHandle, PortState>,
    next_port: u64,
    /// Outstanding reference count per handle ever handed to a caller, used
    /// by tests to assert handle conservation (P3).
    outstanding: HashMap<ServiceHandle, u32>,
}

/// A scripted fake of the host USB registry.
///
/// Tests drive it via [`FakeRegistry::connect`]/[`FakeRegistry::disconnect`];
/// production code only ever sees it through [`RegistryCapability`].
pub struct FakeRegistry {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Default for FakeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRegistry {
    /// An empty registry with no attached devices.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                services: HashMap::new(),
                next_service: 1,
                ports: HashMap::new(),
                next_port: 1,
                outstanding: HashMap::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Attach a new service with the given class and properties, delivering
    /// a `FirstMatch` notification to every port subscribed against a
    /// matching class name.
    pub fn connect(
        &self,
        class_name: &str,
        properties: impl IntoIterator<Item = (&'static str, PropertyValue)>,
    ) -> ServiceHandle {
        let mut state = self.state.lock().unwrap();
        let handle = ServiceHandle(state.next_service);
        state.next_service += 1;
        state.services.insert(
            handle,
            FakeService {
                class_name: class_name.to_string(),
                properties: properties.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                present: true,
            },
        );
        Self::deliver(&mut state, NotificationKind::FirstMatch, class_name, handle);
        drop(state);
        self.condvar.notify_all();
        handle
    }

    /// Detach a previously-connected service, delivering a `Terminated`
    /// notification to every port subscribed against a matching class name.
    /// Subsequent [`RegistryCapability::read_property`] calls on `handle`
    /// fail with [`Error::NotAvailable`].
    pub fn disconnect(&self, handle: ServiceHandle) {
        let mut state = self.state.lock().unwrap();
        let class_name = match state.services.get_mut(&handle) {
            Some(service) => {
                service.present = false;
                service.class_name.clone()
            }
            None => return,
        };
        Self::deliver(&mut state, NotificationKind::Terminated, &class_name, handle);
        drop(state);
        self.condvar.notify_all();
    }

    /// Number of handles handed out that have not been released, for P3
    /// ("handle conservation") assertions in tests.
    pub fn outstanding_handles(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.outstanding.values().filter(|&&n| n > 0).count()
    }

    fn deliver(state: &mut State, kind: NotificationKind, class_name: &str, handle: ServiceHandle) {
        for port in state.ports.values_mut() {
            let matches = port
                .subscriptions
                .iter()
                .any(|(sub_kind, dict)| *sub_kind == kind && dict.class_name == class_name);
            if matches {
                port.pending.entry(kind).or_default().push(handle);
            }
        }
    }

    fn checkout(state: &mut State, handle: ServiceHandle) {
        *state.outstanding.entry(handle).or_insert(0) += 1;
    }
}

impl RegistryCapability for FakeRegistry {
    fn matching_query(&self, class_name: &str) -> MatchDict {
        MatchDict {
            class_name: class_name.to_string(),
        }
    }

    fn services_matching(&self, dict: &MatchDict) -> Result<Vec<ServiceHandle>, Error> {
        let mut state = self.state.lock().unwrap();
        let handles: Vec<ServiceHandle> = state
            .services
            .iter()
            .filter(|(_, svc)| svc.present && svc.class_name == dict.class_name)
            .map(|(h, _)| *h)
            .collect();
        for handle in &handles {
            Self::checkout(&mut state, *handle);
        }
        Ok(handles)
    }

    fn read_property(
        &self,
        handle: ServiceHandle,
        key: &str,
    ) -> Result<Option<PropertyValue>, Error> {
        let state = self.state.lock().unwrap();
        match state.services.get(&handle) {
            Some(service) if service.present => Ok(service.properties.get(key).cloned()),
            _ => Err(Error::NotAvailable),
        }
    }

    fn create_notification_port(&self) -> Result<NotificationPortHandle, Error> {
        let mut state = self.state.lock().unwrap();
        let handle = NotificationPortHandle(state.next_port);
        state.next_port += 1;
        state.ports.insert(handle, PortState::new());
        Ok(handle)
    }

    fn subscribe(
        &self,
        port: NotificationPortHandle,
        kind: NotificationKind,
        dict: &MatchDict,
    ) -> Result<Vec<ServiceHandle>, Error> {
        let mut state = self.state.lock().unwrap();
        let initial: Vec<ServiceHandle> = if kind == NotificationKind::FirstMatch {
            state
                .services
                .iter()
                .filter(|(_, svc)| svc.present && svc.class_name == dict.class_name)
                .map(|(h, _)| *h)
                .collect()
        } else {
            Vec::new()
        };
        let port_state = state
            .ports
            .get_mut(&port)
            .ok_or(Error::InvalidParameters)?;
        port_state.subscriptions.push((kind, dict.clone()));
        for handle in &initial {
            *state.outstanding.entry(*handle).or_insert(0) += 1;
        }
        Ok(initial)
    }

    fn wait_for_notification(&self, port: NotificationPortHandle, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let state = self.state.lock().unwrap();
        let has_pending = |state: &State| {
            state
                .ports
                .get(&port)
                .map(|p| p.pending.values().any(|v| !v.is_empty()))
                .unwrap_or(false)
        };
        let mut state = state;
        while !has_pending(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, timeout_result) =
                self.condvar.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if timeout_result.timed_out() && !has_pending(&state) {
                return false;
            }
        }
        true
    }

    fn drain(&self, port: NotificationPortHandle, kind: NotificationKind) -> Vec<ServiceHandle> {
        let mut state = self.state.lock().unwrap();
        match state.ports.get_mut(&port) {
            Some(port_state) => port_state.pending.remove(&kind).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn destroy_port(&self, port: NotificationPortHandle) {
        let mut state = self.state.lock().unwrap();
        state.ports.remove(&port);
    }

    fn release(&self, handle: ServiceHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.outstanding.get_mut(&handle) {
            *count = count.saturating_sub(1);
        }
    }
}
