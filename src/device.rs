//! The `UsbDevice` value record and device identity (`spec.md` §3).

use std::fmt;

/// Connection speed of a device, as reported by the registry's `Device
/// Speed` property (`spec.md` §4.3: `0->low, 1->full, 2->high, 3->super,
/// other->unknown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speed {
    /// Low speed (1.5 Mbit).
    Low,
    /// Full speed (12 Mbit).
    Full,
    /// High speed (480 Mbit).
    High,
    /// Super speed (5000 Mbit).
    Super,
    /// Speed reported by the registry but not one of the known values.
    Unknown,
}

impl Speed {
    /// Map the registry's raw `Device Speed` value.
    pub(crate) fn from_registry_value(value: u32) -> Speed {
        match value {
            0 => Speed::Low,
            1 => Speed::Full,
            2 => Speed::High,
            3 => Speed::Super,
            _ => Speed::Unknown,
        }
    }
}

/// Identity of a physical attachment point: `(bus_id, device_id)`
/// (`spec.md` §3). Two [`UsbDevice`] records with equal identity refer to
/// the same physical attachment point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// Decimal string derived from bits 31..24 of `locationID`.
    pub bus_id: String,
    /// Decimal string derived from bits 23..16 of `locationID`.
    pub device_id: String,
}

impl DeviceIdentity {
    /// Build an identity directly from bus/device id strings.
    pub fn new(bus_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Derive `(bus_id, device_id)` from a raw `locationID` per `spec.md`
    /// §4.3: `locationID = 0xAABBCCDD`, `bus_id = decimal(0xAA)`,
    /// `device_id = decimal(0xBB)`. Lower 16 bits are ignored.
    pub fn from_location_id(location_id: u32) -> Self {
        let bus = (location_id >> 24) & 0xff;
        let dev = (location_id >> 16) & 0xff;
        Self {
            bus_id: bus.to_string(),
            device_id: dev.to_string(),
        }
    }

    /// The `"{bus_id}:{device_id}"` key the monitor's `KnownSet` uses
    /// (`spec.md` §4.4).
    pub fn key(&self) -> String {
        format!("{}:{}", self.bus_id, self.device_id)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus_id, self.device_id)
    }
}

/// An immutable, canonical record of a discovered USB device (`spec.md`
/// §3). Constructed once by enumeration and never mutated afterward;
/// refreshing a device means constructing a new record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// Physical attachment point.
    pub identity: DeviceIdentity,
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Device class code.
    pub device_class: u8,
    /// Device subclass code.
    pub device_subclass: u8,
    /// Device protocol code.
    pub device_protocol: u8,
    /// Negotiated connection speed.
    pub speed: Speed,
    /// `USB Vendor Name` descriptor string, if the registry had one.
    pub manufacturer: Option<String>,
    /// `USB Product Name` descriptor string, if the registry had one.
    pub product: Option<String>,
    /// `USB Serial Number` descriptor string, if the registry had one.
    pub serial: Option<String>,
}

impl UsbDevice {
    /// Convenience accessor for `identity.bus_id`.
    pub fn bus_id(&self) -> &str {
        &self.identity.bus_id
    }

    /// Convenience accessor for `identity.device_id`.
    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }
}
