//! Randomized property tests for the invariants named in `spec.md` §8
//! (P1-P4; P5-P7 are exercised deterministically by `communicator`'s own
//! unit tests, since they turn on thread scheduling/cancellation rather
//! than on input shape).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use proptest::prelude::*;

use usbip_device_core::clock::Clock;
use usbip_device_core::config::CoreConfig;
use usbip_device_core::device::DeviceIdentity;
use usbip_device_core::discovery::Discovery;
use usbip_device_core::error::{Error, ErrorContext};
use usbip_device_core::mapper;
use usbip_device_core::monitor::{DeviceEventKind, DeviceMonitor};
use usbip_device_core::registry::fake::FakeRegistry;
use usbip_device_core::registry::PropertyValue;

/// A [`Clock`] whose `now()` can be advanced under test control, so cache-TTL
/// behavior can be checked without real sleeps.
struct FakeClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl FakeClock {
    fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    fn advance(&self, ms: u64) {
        self.offset_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration.as_millis() as u64);
    }
}

fn props(vendor: u16, location: u32) -> Vec<(&'static str, PropertyValue)> {
    vec![
        ("idVendor", PropertyValue::U16(vendor)),
        ("idProduct", PropertyValue::U16(0x0001)),
        ("locationID", PropertyValue::U32(location)),
    ]
}

proptest! {
    /// P1: a `discover()` call inside the configured TTL is served from
    /// cache (unaffected by registry changes since the last enumeration); a
    /// call at or past the TTL re-enumerates.
    #[test]
    fn cache_freshness_boundary(ttl_ms in 50u64..5000, before_ttl_ms in 0u64..49, past_ttl_ms in 1u64..2000) {
        let registry = Arc::new(FakeRegistry::new());
        registry.connect("IOUSBDevice", props(0x1111, 0x1410_0000));
        let clock = Arc::new(FakeClock::new());
        let config = CoreConfig {
            cache_ttl: Duration::from_millis(ttl_ms),
            ..CoreConfig::default()
        };
        let discovery = Discovery::new(registry.clone(), clock.clone(), config);

        let first = discovery.discover().unwrap();
        prop_assert_eq!(first.len(), 1);

        registry.connect("IOUSBDevice", props(0x2222, 0x1420_0000));
        clock.advance(before_ttl_ms.min(ttl_ms.saturating_sub(1)));
        let within_ttl = discovery.discover().unwrap();
        prop_assert_eq!(within_ttl.len(), 1, "must still be served from cache inside the TTL");

        clock.advance(ttl_ms + past_ttl_ms);
        let after_ttl = discovery.discover().unwrap();
        prop_assert_eq!(after_ttl.len(), 2, "must re-enumerate once the TTL has elapsed");
    }

    /// P2: however many times the same physical attachment point is
    /// (re)delivered as a first-match event, the monitor reports exactly one
    /// `Connected` event and one entry in the known set.
    #[test]
    fn notification_dedup_is_redelivery_count_independent(redeliveries in 1usize..8) {
        let registry = Arc::new(FakeRegistry::new());
        let discovery = Arc::new(Discovery::new(registry.clone(), Arc::new(FakeClock::new()), CoreConfig::default()));
        let monitor = DeviceMonitor::new(discovery);
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            monitor.subscribe(move |e| events.lock().unwrap().push(e));
        }
        monitor.start().unwrap();

        for _ in 0..redeliveries {
            registry.connect("IOUSBDevice", props(0x1234, 0x0a01_0000));
            std::thread::sleep(Duration::from_millis(30));
        }

        let connected = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == DeviceEventKind::Connected)
            .count();
        prop_assert_eq!(connected, 1);
        prop_assert_eq!(monitor.known().len(), 1);
        monitor.stop();
    }

    /// P3: after an arbitrary number of connect/release cycles, no service
    /// handle is left outstanding.
    #[test]
    fn handle_conservation_over_arbitrary_cycles(cycles in 1usize..12) {
        let registry = FakeRegistry::new();
        let dict = registry.matching_query("IOUSBDevice");
        for i in 0..cycles {
            registry.connect("IOUSBDevice", props(0x1234, 0x0a00_0000 | ((i as u32) << 16)));
        }
        let handles = registry.services_matching(&dict).unwrap();
        prop_assert_eq!(handles.len(), cycles);
        prop_assert_eq!(registry.outstanding_handles(), cycles);
        for h in handles {
            registry.release(h);
        }
        prop_assert_eq!(registry.outstanding_handles(), 0);
    }

    /// P4: mapping never panics over the full `i32` return-code space, and
    /// every unrecognized negative code is preserved verbatim in
    /// `RegistryError`.
    #[test]
    fn mapping_totality_over_arbitrary_codes(code in any::<i32>()) {
        let ctx = ErrorContext::new("op");
        let (err, _hint, _tag) = mapper::map(code, &ctx);
        if let Error::RegistryError { code: preserved, .. } = err {
            prop_assert_eq!(preserved, code as u32);
        }
    }

    #[test]
    fn device_identity_key_is_stable_for_any_location_id(location in any::<u32>()) {
        let a = DeviceIdentity::from_location_id(location);
        let b = DeviceIdentity::from_location_id(location);
        prop_assert_eq!(a.key(), b.key());
    }
}
