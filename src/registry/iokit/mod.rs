//! The macOS IOKit backend for [`RegistryCapability`].
//!
//! Combines the teacher's `platform/macos_iokit` machinery — the
//! `IoServiceIterator`/`call_iokit_function!`/`check_iokit_return` wrappers
//! in `iokit.rs`, the shared background `CFRunLoop` thread in `events.rs`,
//! and the drain-at-registration notification pattern in `hotplug.rs` — with
//! `ktemkin-usrs`'s property-extraction helpers ([`properties`]), since the
//! teacher's own `platform/macos_iokit/enumeration.rs` never got past
//! `todo!()`.

mod events;
mod properties;

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CString};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use core_foundation::base::TCFType;
use core_foundation::dictionary::CFDictionary;
use core_foundation::runloop::CFRunLoopSource;
use io_kit_sys::keys::{kIOFirstMatchNotification, kIOTerminatedNotification};
use io_kit_sys::ret::{kIOReturnSuccess, IOReturn};
use io_kit_sys::types::{io_iterator_t, io_object_t};
use io_kit_sys::{
    kIOMasterPortDefault, IOIteratorNext, IONotificationPort, IONotificationPortCreate,
    IONotificationPortDestroy, IONotificationPortGetRunLoopSource, IOObjectRelease,
    IOServiceAddMatchingNotification, IOServiceGetMatchingServices, IOServiceMatching,
};
use slab::Slab;

use crate::error::{Error, ErrorContext};
use crate::mapper;
use crate::registry::{
    MatchDict, NotificationKind, NotificationPortHandle, PropertyValue, RegistryCapability,
    ServiceHandle,
};

use events::{add_event_source, EventRegistration};

// Signals are owned by a global slab, not by the refcon pointer itself, so a
// notification callback racing with port teardown looks up a dead index in a
// table that outlives every port instead of dereferencing freed memory.
static SIGNALS: Mutex<Slab<Arc<Signal>>> = Mutex::new(Slab::new());

/// A [`Signal`] registered with [`SIGNALS`], identified by its slab index.
struct SlabSignal(usize);

impl SlabSignal {
    fn new(signal: Arc<Signal>) -> Self {
        SlabSignal(SIGNALS.lock().unwrap().insert(signal))
    }
}

impl Drop for SlabSignal {
    fn drop(&mut self) {
        SIGNALS.lock().unwrap().remove(self.0);
    }
}

fn check(code: IOReturn, operation: &'static str) -> Result<(), Error> {
    if code == kIOReturnSuccess {
        return Ok(());
    }
    let ctx = ErrorContext::new(operation);
    let (err, _, _) = mapper::map(code, &ctx);
    Err(err)
}

/// Drain an `io_iterator_t` to exhaustion, collecting each returned object
/// as a [`ServiceHandle`]. Each `IOIteratorNext` call transfers one
/// reference to the caller, matching [`RegistryCapability::release`]'s
/// contract of exactly one release per handle.
///
/// # Safety
/// `iter` must be a valid `io_iterator_t` of USB services.
unsafe fn drain_iterator(iter: io_iterator_t) -> Vec<ServiceHandle> {
    let mut handles = Vec::new();
    loop {
        let object: io_object_t = IOIteratorNext(iter);
        if object == 0 {
            break;
        }
        handles.push(ServiceHandle(object as u64));
    }
    handles
}

struct Signal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn raise(&self) {
        *self.pending.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    /// Wait until raised or `timeout` elapses, then clear the flag. Callers
    /// must drain every subscription on the port after a `true` return,
    /// mirroring the teacher's `MacHotplugWatch::poll_next`, which checks
    /// both its matched and terminated iterators on every wake regardless of
    /// which one fired.
    fn wait_and_clear(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.condvar.wait_timeout(pending, deadline - now).unwrap();
            pending = guard;
        }
        *pending = false;
        true
    }
}

struct Subscription {
    iterator: io_iterator_t,
}

struct PortState {
    port: *mut IONotificationPort,
    signal: Arc<Signal>,
    slab_signal: SlabSignal,
    subscriptions: HashMap<NotificationKind, Subscription>,
    _registration: EventRegistration,
}

unsafe impl Send for PortState {}

impl Drop for PortState {
    fn drop(&mut self) {
        for sub in self.subscriptions.values() {
            unsafe { IOObjectRelease(sub.iterator) };
        }
        unsafe { IONotificationPortDestroy(self.port) };
    }
}

/// IOKit-backed [`RegistryCapability`].
pub struct IoKitRegistry {
    ports: Mutex<HashMap<NotificationPortHandle, PortState>>,
    next_port: Mutex<u64>,
}

impl Default for IoKitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IoKitRegistry {
    /// A fresh backend with no notification ports registered yet.
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
            next_port: Mutex::new(1),
        }
    }

    fn event_const(kind: NotificationKind) -> *const c_char {
        match kind {
            NotificationKind::FirstMatch => kIOFirstMatchNotification,
            NotificationKind::Terminated => kIOTerminatedNotification,
        }
    }
}

unsafe impl Send for IoKitRegistry {}
unsafe impl Sync for IoKitRegistry {}

impl RegistryCapability for IoKitRegistry {
    fn matching_query(&self, class_name: &str) -> MatchDict {
        MatchDict {
            class_name: class_name.to_string(),
        }
    }

    fn services_matching(&self, dict: &MatchDict) -> Result<Vec<ServiceHandle>, Error> {
        unsafe {
            let class_name = CString::new(dict.class_name.clone())
                .map_err(|_| Error::InvalidParameters)?;
            let matching = IOServiceMatching(class_name.as_ptr());
            if matching.is_null() {
                return Err(Error::InvalidParameters);
            }
            let mut iter: io_iterator_t = 0;
            let r = IOServiceGetMatchingServices(kIOMasterPortDefault, matching, &mut iter);
            check(r, "services_matching")?;
            let handles = drain_iterator(iter);
            IOObjectRelease(iter);
            Ok(handles)
        }
    }

    fn read_property(
        &self,
        handle: ServiceHandle,
        key: &str,
    ) -> Result<Option<PropertyValue>, Error> {
        unsafe { properties::search_property(handle.0 as io_object_t, key) }
    }

    fn create_notification_port(&self) -> Result<NotificationPortHandle, Error> {
        unsafe {
            let port = IONotificationPortCreate(kIOMasterPortDefault);
            if port.is_null() {
                return Err(Error::RegistryError {
                    code: 0,
                    message: "IONotificationPortCreate returned null".into(),
                });
            }
            let source = CFRunLoopSource::wrap_under_get_rule(IONotificationPortGetRunLoopSource(
                port,
            ));
            let registration = add_event_source(source);

            let mut next_port = self.next_port.lock().unwrap();
            let handle = NotificationPortHandle(*next_port);
            *next_port += 1;
            drop(next_port);

            let signal = Arc::new(Signal::new());
            let slab_signal = SlabSignal::new(signal.clone());
            let state = PortState {
                port,
                signal,
                slab_signal,
                subscriptions: HashMap::new(),
                _registration: registration,
            };
            self.ports.lock().unwrap().insert(handle, state);
            Ok(handle)
        }
    }

    fn subscribe(
        &self,
        port: NotificationPortHandle,
        kind: NotificationKind,
        dict: &MatchDict,
    ) -> Result<Vec<ServiceHandle>, Error> {
        let mut ports = self.ports.lock().unwrap();
        let state = ports.get_mut(&port).ok_or(Error::InvalidParameters)?;

        let class_name = CString::new(dict.class_name.clone()).map_err(|_| Error::InvalidParameters)?;
        unsafe {
            let matching = IOServiceMatching(class_name.as_ptr());
            if matching.is_null() {
                return Err(Error::InvalidParameters);
            }
            let matching = CFDictionary::wrap_under_create_rule(matching);
            let refcon = state.slab_signal.0 as *mut c_void;
            let mut iterator: io_iterator_t = 0;
            let r = IOServiceAddMatchingNotification(
                state.port,
                Self::event_const(kind) as *mut c_char,
                std::mem::ManuallyDrop::new(matching.clone()).as_concrete_TypeRef(),
                notification_callback,
                refcon,
                &mut iterator,
            );
            check(r, "subscribe")?;

            // Drain already-matching services so the subscription is armed
            // for future events only, same as the teacher's
            // `register_notification`.
            let initial = drain_iterator(iterator);
            state
                .subscriptions
                .insert(kind, Subscription { iterator });
            Ok(initial)
        }
    }

    fn wait_for_notification(&self, port: NotificationPortHandle, timeout: Duration) -> bool {
        let signal = {
            let ports = self.ports.lock().unwrap();
            match ports.get(&port) {
                Some(state) => state.signal.clone(),
                None => return false,
            }
        };
        signal.wait_and_clear(timeout)
    }

    fn drain(&self, port: NotificationPortHandle, kind: NotificationKind) -> Vec<ServiceHandle> {
        let ports = self.ports.lock().unwrap();
        match ports.get(&port).and_then(|s| s.subscriptions.get(&kind)) {
            Some(sub) => unsafe { drain_iterator(sub.iterator) },
            None => Vec::new(),
        }
    }

    fn destroy_port(&self, port: NotificationPortHandle) {
        self.ports.lock().unwrap().remove(&port);
    }

    fn release(&self, handle: ServiceHandle) {
        unsafe { IOObjectRelease(handle.0 as io_object_t) };
    }
}

unsafe extern "C" fn notification_callback(refcon: *mut c_void, _iterator: io_iterator_t) {
    let id = refcon as usize;
    if let Some(signal) = SIGNALS.lock().unwrap().get(id) {
        signal.raise();
    }
}
