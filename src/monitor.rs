//! Device Monitor (C4, `spec.md` §4.4).
//!
//! Wraps [`Discovery`] and enforces exactly-once connect/disconnect
//! semantics per device identity over raw callbacks that may legitimately
//! redeliver (initial drain vs. notification stream). This is the "cyclic
//! ownership" design from `spec.md` §9 resolved as one-way ownership:
//! `DeviceMonitor` owns `Discovery` and hands it a pair of function values at
//! construction, mirroring how the teacher's own `hotplug.rs` hands a waker
//! down into `platform::HotplugWatch` rather than the reverse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::device::UsbDevice;
use crate::discovery::Discovery;
use crate::error::Error;

/// The kind of a [`DeviceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// A device was newly observed as attached.
    Connected,
    /// A previously-known device was removed.
    Disconnected,
}

/// A deduplicated, higher-level device event (`spec.md` §4.4).
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// Whether this is a connect or disconnect event.
    pub kind: DeviceEventKind,
    /// The device record. For `Disconnected`, this is the last known record
    /// (the live one may be missing properties).
    pub device: UsbDevice,
    /// Wall-clock time the event was recognized.
    pub timestamp: SystemTime,
}

type EventCallback = Box<dyn Fn(DeviceEvent) + Send + Sync>;

/// Dedup layer and event fan-out over [`Discovery`] (C4).
pub struct DeviceMonitor {
    discovery: Arc<Discovery>,
    known: Mutex<HashMap<String, UsbDevice>>,
    subscribers: Mutex<Vec<EventCallback>>,
}

impl DeviceMonitor {
    /// Build a monitor over `discovery`. Call [`DeviceMonitor::start`]
    /// afterward; construction alone does not begin watching.
    pub fn new(discovery: Arc<Discovery>) -> Arc<Self> {
        let monitor = Arc::new(Self {
            discovery,
            known: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        });

        let on_connect = {
            let monitor = Arc::clone(&monitor);
            move |device: UsbDevice| monitor.on_connected(device)
        };
        let on_disconnect = {
            let monitor = Arc::clone(&monitor);
            move |device: UsbDevice| monitor.on_disconnected(device)
        };
        monitor.discovery.set_callbacks(on_connect, on_disconnect);
        monitor
    }

    /// Register a subscriber for [`DeviceEvent`]s. Subscribers added after
    /// [`DeviceMonitor::start`] only observe events from that point forward.
    pub fn subscribe(&self, on_event: impl Fn(DeviceEvent) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Box::new(on_event));
    }

    /// Seed [`DeviceMonitor::known`] from [`Discovery::discover`], then
    /// start notifications. Idempotent (delegated to `Discovery`, itself
    /// idempotent).
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        self.discovery.discover()?;
        self.discovery.start_notifications()
    }

    /// Stop notifications and clear the known set.
    pub fn stop(&self) {
        self.discovery.stop_notifications();
        self.known.lock().unwrap().clear();
    }

    /// Snapshot of currently-known devices; order unspecified.
    pub fn known(&self) -> Vec<UsbDevice> {
        self.known.lock().unwrap().values().cloned().collect()
    }

    fn on_connected(&self, device: UsbDevice) {
        let key = device.identity.key();
        let mut known = self.known.lock().unwrap();
        if known.contains_key(&key) {
            return; // deduplicated: already known
        }
        known.insert(key, device.clone());
        drop(known);
        self.emit(DeviceEventKind::Connected, device);
    }

    fn on_disconnected(&self, device: UsbDevice) {
        let key = device.identity.key();
        let mut known = self.known.lock().unwrap();
        let Some(stored) = known.remove(&key) else {
            return; // deduplicated: not known
        };
        drop(known);
        // The stored record is authoritative: the fresh one may lack
        // properties, since the device is already gone by the time the
        // terminated notification fires.
        self.emit(DeviceEventKind::Disconnected, stored);
    }

    fn emit(&self, kind: DeviceEventKind, device: UsbDevice) {
        let event = DeviceEvent {
            kind,
            device,
            timestamp: SystemTime::now(),
        };
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::CoreConfig;
    use crate::registry::fake::FakeRegistry;
    use crate::registry::PropertyValue;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn props(vendor: u16, product: u16, location: u32) -> Vec<(&'static str, PropertyValue)> {
        vec![
            ("idVendor", PropertyValue::U16(vendor)),
            ("idProduct", PropertyValue::U16(product)),
            ("locationID", PropertyValue::U32(location)),
        ]
    }

    fn monitor_over(registry: Arc<FakeRegistry>) -> Arc<DeviceMonitor> {
        let discovery = Arc::new(Discovery::new(registry, Arc::new(SystemClock), CoreConfig::default()));
        DeviceMonitor::new(discovery)
    }

    #[test]
    fn boot_with_two_devices_known_has_exactly_two() {
        let registry = Arc::new(FakeRegistry::new());
        registry.connect("IOUSBDevice", props(0x05ac, 0x024f, 0x1410_0000));
        registry.connect("IOUSBDevice", props(0x046d, 0xc31c, 0x1420_0000));
        let monitor = monitor_over(registry);

        monitor.start().unwrap();
        let known = monitor.known();
        assert_eq!(known.len(), 2);
        assert!(known.iter().all(|d| d.bus_id() == "20"));
        let mut device_ids: Vec<_> = known.iter().map(|d| d.device_id().to_string()).collect();
        device_ids.sort();
        assert_eq!(device_ids, vec!["16", "32"]);
        monitor.stop();
    }

    #[test]
    fn boot_emits_connected_for_seeded_devices() {
        let registry = Arc::new(FakeRegistry::new());
        registry.connect("IOUSBDevice", props(0x05ac, 0x024f, 0x1410_0000));
        let monitor = monitor_over(registry);

        let events = Arc::new(StdMutex::new(Vec::new()));
        {
            let events = events.clone();
            monitor.subscribe(move |e| events.lock().unwrap().push(e));
        }
        monitor.start().unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DeviceEventKind::Connected);
        monitor.stop();
    }

    #[test]
    fn hotplug_redelivery_produces_zero_additional_events() {
        let registry = Arc::new(FakeRegistry::new());
        let monitor = monitor_over(registry.clone());
        let events = Arc::new(StdMutex::new(Vec::new()));
        {
            let events = events.clone();
            monitor.subscribe(move |e| events.lock().unwrap().push(e));
        }
        monitor.start().unwrap();

        let handle = registry.connect("IOUSBDevice", props(0x1234, 0x5678, 0x0a01_0000));
        std::thread::sleep(Duration::from_millis(50));
        // Simulate a redelivery of the same first-match event directly
        // against the monitor's dedup logic (the registry layer itself
        // would not normally redeliver, but C4 must tolerate it regardless
        // per `spec.md` §4.4's rationale).
        let device = monitor.known().into_iter().find(|d| d.bus_id() == "10").unwrap();
        monitor.on_connected(device);

        let events = events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == DeviceEventKind::Connected).count(), 1);
        drop(events);
        registry.release(handle);
        monitor.stop();
    }

    #[test]
    fn disconnect_uses_stored_record_not_fresh_one() {
        let registry = Arc::new(FakeRegistry::new());
        let monitor = monitor_over(registry.clone());
        monitor.start().unwrap();
        let handle = registry.connect("IOUSBDevice", props(0x1234, 0x5678, 0x1410_0000));
        std::thread::sleep(Duration::from_millis(50));

        let events = Arc::new(StdMutex::new(Vec::new()));
        {
            let events = events.clone();
            monitor.subscribe(move |e| events.lock().unwrap().push(e));
        }
        registry.disconnect(handle);
        std::thread::sleep(Duration::from_millis(50));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DeviceEventKind::Disconnected);
        assert_eq!(events[0].device.vendor_id, 0x1234);
        monitor.stop();
    }

    #[test]
    fn unknown_disconnect_is_dropped() {
        let registry = Arc::new(FakeRegistry::new());
        let monitor = monitor_over(registry);
        let events = Arc::new(StdMutex::new(Vec::new()));
        {
            let events = events.clone();
            monitor.subscribe(move |e| events.lock().unwrap().push(e));
        }
        // A disconnect for a device never seen as connected.
        let phantom = crate::device::UsbDevice {
            identity: crate::device::DeviceIdentity::new("99", "99"),
            vendor_id: 0,
            product_id: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            speed: crate::device::Speed::Unknown,
            manufacturer: None,
            product: None,
            serial: None,
        };
        monitor.on_disconnected(phantom);
        assert!(events.lock().unwrap().is_empty());
    }
}
