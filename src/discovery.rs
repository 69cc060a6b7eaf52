//! Device Discovery (C3, `spec.md` §4.3).
//!
//! Owns the [`crate::registry::RegistryCapability`] enumeration calls, the
//! short-TTL [`Discovery::discover`] cache, the connect-cache fed by the
//! notification stream, and the background notification thread. Grounded in
//! the teacher's `enumeration.rs` (enumerate-and-skip-on-error loop) and
//! `platform/macos_iokit/hotplug.rs` (already-connected drain at
//! registration), translated from the teacher's `Future`-returning,
//! single-shot `watch_devices()` into a persistent component with explicit
//! `start_notifications`/`stop_notifications` lifecycle per `spec.md` §4.3.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::device::{DeviceIdentity, Speed, UsbDevice};
use crate::error::Error;
use crate::registry::{MatchDict, NotificationKind, NotificationPortHandle, RegistryCapability, ServiceHandle};

const USB_DEVICE_CLASS: &str = "IOUSBDevice";

type DeviceCallback = Box<dyn Fn(UsbDevice) + Send + Sync>;

struct CacheEntry {
    devices: Vec<UsbDevice>,
    at: Instant,
}

#[derive(Default)]
struct ConnectCache {
    by_identity: HashMap<String, UsbDevice>,
    by_handle: HashMap<ServiceHandle, String>,
}

impl ConnectCache {
    fn clear(&mut self) {
        self.by_identity.clear();
        self.by_handle.clear();
    }

    fn is_empty(&self) -> bool {
        self.by_identity.is_empty() && self.by_handle.is_empty()
    }
}

struct MonitoringState {
    port: NotificationPortHandle,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Enumerates and watches the attached USB device set (C3).
pub struct Discovery {
    registry: Arc<dyn RegistryCapability>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    cache: Mutex<Option<CacheEntry>>,
    connect_cache: Mutex<ConnectCache>,
    monitoring: Mutex<Option<MonitoringState>>,
    on_connected: Mutex<Option<DeviceCallback>>,
    on_disconnected: Mutex<Option<DeviceCallback>>,
}

impl Discovery {
    /// Build a new, unstarted `Discovery` over `registry`.
    pub fn new(registry: Arc<dyn RegistryCapability>, clock: Arc<dyn Clock>, config: CoreConfig) -> Self {
        Self {
            registry,
            clock,
            config,
            cache: Mutex::new(None),
            connect_cache: Mutex::new(ConnectCache::default()),
            monitoring: Mutex::new(None),
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
        }
    }

    /// Register the connect/disconnect callbacks (`spec.md` §4.3). Must be
    /// called before [`Discovery::start_notifications`] to see every event;
    /// `spec.md` §9 models this as "a capability the Monitor registers with
    /// Discovery", so this crate's `DeviceMonitor` is the intended caller.
    pub fn set_callbacks(
        &self,
        on_connected: impl Fn(UsbDevice) + Send + Sync + 'static,
        on_disconnected: impl Fn(UsbDevice) + Send + Sync + 'static,
    ) {
        *self.on_connected.lock().unwrap() = Some(Box::new(on_connected));
        *self.on_disconnected.lock().unwrap() = Some(Box::new(on_disconnected));
    }

    /// All currently-attached USB devices. Serves from the cache if its age
    /// is under `cache_ttl`; otherwise performs a full enumeration under
    /// [`RetryPolicy`](crate::retry::RetryPolicy) and repopulates it.
    pub fn discover(&self) -> Result<Vec<UsbDevice>, Error> {
        if let Some(entry) = self.cache.lock().unwrap().as_ref() {
            if self.clock.now().duration_since(entry.at) < self.config.cache_ttl {
                return Ok(entry.devices.clone());
            }
        }
        let devices = self.enumerate()?;
        *self.cache.lock().unwrap() = Some(CacheEntry {
            devices: devices.clone(),
            at: self.clock.now(),
        });
        Ok(devices)
    }

    /// Look up one device by identity. Consults the connect-cache first;
    /// falls back to [`Discovery::discover`] on miss.
    pub fn lookup(&self, bus_id: &str, device_id: &str) -> Option<UsbDevice> {
        let key = format!("{bus_id}:{device_id}");
        if let Some(device) = self.connect_cache.lock().unwrap().by_identity.get(&key).cloned() {
            return Some(device);
        }
        self.discover()
            .ok()?
            .into_iter()
            .find(|d| d.bus_id() == bus_id && d.device_id() == device_id)
    }

    fn enumerate(&self) -> Result<Vec<UsbDevice>, Error> {
        let dict = self.registry.matching_query(USB_DEVICE_CLASS);
        self.config
            .retry
            .run(self.clock.as_ref(), "discover", |_attempt| self.enumerate_once(&dict))
    }

    fn enumerate_once(&self, dict: &MatchDict) -> Result<Vec<UsbDevice>, Error> {
        let handles = self.registry.services_matching(dict)?;
        let mut devices: HashMap<String, UsbDevice> = HashMap::new();
        for handle in handles {
            let result = build_device(self.registry.as_ref(), handle);
            self.registry.release(handle);
            match result {
                Ok(device) => {
                    let key = device.identity.key();
                    if devices.contains_key(&key) {
                        log::warn!("colliding (bus_id, device_id) {key}; later enumeration wins");
                    }
                    devices.insert(key, device);
                }
                Err(err) => {
                    log::warn!("skipping device during enumeration: {err}");
                }
            }
        }
        Ok(devices.into_values().collect())
    }

    /// Start the notification subscription, if not already running.
    /// Idempotent. Seeds the connect-cache (and fires `on_connected`) for
    /// every already-attached device via the drain-at-registration pattern.
    /// Fails atomically: if any step after `create_notification_port`
    /// fails, the port is torn down before the error is returned.
    pub fn start_notifications(self: &Arc<Self>) -> Result<(), Error> {
        let mut monitoring = self.monitoring.lock().unwrap();
        if monitoring.is_some() {
            return Ok(());
        }

        let dict = self.registry.matching_query(USB_DEVICE_CLASS);
        let port = self.registry.create_notification_port()?;

        let seeded = (|| -> Result<(), Error> {
            let first_match = self.registry.subscribe(port, NotificationKind::FirstMatch, &dict)?;
            let terminated = self.registry.subscribe(port, NotificationKind::Terminated, &dict)?;
            for handle in first_match {
                self.handle_first_match(handle);
            }
            // Should be empty; drained and discarded per `spec.md` §4.3.
            for handle in terminated {
                self.registry.release(handle);
            }
            Ok(())
        })();

        if let Err(err) = seeded {
            self.registry.destroy_port(port);
            return Err(err);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let this = Arc::clone(self);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || this.notification_loop(port, shutdown))
        };

        *monitoring = Some(MonitoringState {
            port,
            shutdown,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stop the notification subscription and clear the connect-cache, if
    /// running. Idempotent.
    pub fn stop_notifications(&self) {
        let mut monitoring = self.monitoring.lock().unwrap();
        let Some(mut state) = monitoring.take() else {
            return;
        };
        state.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = state.thread.take() {
            let _ = thread.join();
        }
        self.registry.destroy_port(state.port);
        self.connect_cache.lock().unwrap().clear();
        drop(monitoring);
        self.verify_cleanup();
    }

    /// Whether the notification subscription is currently active.
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.lock().unwrap().is_some()
    }

    /// Post-condition check for [`Discovery::stop_notifications`]
    /// (`spec.md` §4.3). The two iterators named in the spec are owned
    /// internally by the registry capability (its `destroy_port` tears them
    /// down); at this layer, a clean stop means the monitoring flag and
    /// connect-cache are both empty.
    fn verify_cleanup(&self) {
        debug_assert!(self.monitoring.lock().unwrap().is_none());
        debug_assert!(self.connect_cache.lock().unwrap().is_empty());
    }

    fn notification_loop(&self, port: NotificationPortHandle, shutdown: Arc<AtomicBool>) {
        const POLL_INTERVAL: Duration = Duration::from_millis(200);
        while !shutdown.load(Ordering::Relaxed) {
            if self.registry.wait_for_notification(port, POLL_INTERVAL) {
                for handle in self.registry.drain(port, NotificationKind::FirstMatch) {
                    self.handle_first_match(handle);
                }
                for handle in self.registry.drain(port, NotificationKind::Terminated) {
                    self.handle_terminated(handle);
                }
            }
        }
    }

    fn handle_first_match(&self, handle: ServiceHandle) {
        match build_device(self.registry.as_ref(), handle) {
            Ok(device) => {
                let key = device.identity.key();
                {
                    let mut cache = self.connect_cache.lock().unwrap();
                    cache.by_identity.insert(key.clone(), device.clone());
                    cache.by_handle.insert(handle, key);
                }
                if let Some(cb) = self.on_connected.lock().unwrap().as_ref() {
                    cb(device);
                }
            }
            Err(err) => log::warn!("failed to probe connected device: {err}"),
        }
        self.registry.release(handle);
    }

    fn handle_terminated(&self, handle: ServiceHandle) {
        // Removal is keyed by service handle identity, not by re-reading
        // properties (which would fail on a gone device) — the improvement
        // over the distilled source recorded in `spec.md` §9's open question.
        let stored = {
            let mut cache = self.connect_cache.lock().unwrap();
            match cache.by_handle.remove(&handle) {
                Some(key) => cache.by_identity.remove(&key),
                None => None,
            }
        };
        match stored {
            Some(device) => {
                if let Some(cb) = self.on_disconnected.lock().unwrap().as_ref() {
                    cb(device);
                }
            }
            None => log::debug!("terminated notification for an untracked handle; dropping event"),
        }
        self.registry.release(handle);
    }
}

fn build_device(registry: &dyn RegistryCapability, handle: ServiceHandle) -> Result<UsbDevice, Error> {
    let vendor_id = required_u16(registry, handle, "idVendor")?;
    let product_id = required_u16(registry, handle, "idProduct")?;
    let location_id = required_u32(registry, handle, "locationID")?;
    let device_class = optional_u8(registry, handle, "bDeviceClass", 0)?;
    let device_subclass = optional_u8(registry, handle, "bDeviceSubClass", 0)?;
    let device_protocol = optional_u8(registry, handle, "bDeviceProtocol", 0)?;
    let speed_raw = optional_u32(registry, handle, "Device Speed", u32::MAX)?;
    let manufacturer = optional_string(registry, handle, "USB Vendor Name")?;
    let product = optional_string(registry, handle, "USB Product Name")?;
    let serial = optional_string(registry, handle, "USB Serial Number")?;

    Ok(UsbDevice {
        identity: DeviceIdentity::from_location_id(location_id),
        vendor_id,
        product_id,
        device_class,
        device_subclass,
        device_protocol,
        speed: Speed::from_registry_value(speed_raw),
        manufacturer,
        product,
        serial,
    })
}

fn required_u16(registry: &dyn RegistryCapability, handle: ServiceHandle, key: &str) -> Result<u16, Error> {
    match registry.read_property(handle, key)? {
        Some(v) => v.as_u16().ok_or_else(|| Error::MissingProperty(key.to_string())),
        None => Err(Error::MissingProperty(key.to_string())),
    }
}

fn required_u32(registry: &dyn RegistryCapability, handle: ServiceHandle, key: &str) -> Result<u32, Error> {
    match registry.read_property(handle, key)? {
        Some(v) => v.as_u32().ok_or_else(|| Error::MissingProperty(key.to_string())),
        None => Err(Error::MissingProperty(key.to_string())),
    }
}

fn optional_u8(
    registry: &dyn RegistryCapability,
    handle: ServiceHandle,
    key: &str,
    default: u8,
) -> Result<u8, Error> {
    Ok(registry
        .read_property(handle, key)?
        .and_then(|v| v.as_u8())
        .unwrap_or(default))
}

fn optional_u32(
    registry: &dyn RegistryCapability,
    handle: ServiceHandle,
    key: &str,
    default: u32,
) -> Result<u32, Error> {
    Ok(registry
        .read_property(handle, key)?
        .and_then(|v| v.as_u32())
        .unwrap_or(default))
}

fn optional_string(
    registry: &dyn RegistryCapability,
    handle: ServiceHandle,
    key: &str,
) -> Result<Option<String>, Error> {
    Ok(registry
        .read_property(handle, key)?
        .and_then(|v| v.as_str().map(|s| s.to_string())))
}
