//! OS Registry Adapter (C1, `spec.md` §4.1).
//!
//! A thin capability boundary over the host USB registry. This is the only
//! surface in the crate that touches unsafe OS primitives
//! ([`iokit::IoKitRegistry`]); everything above it ([`crate::discovery`],
//! [`crate::communicator`]) is written against the [`RegistryCapability`]
//! trait and can be exercised with [`fake::FakeRegistry`] instead.
//!
//! The concrete shape follows `spec.md` §4.1
//! (`matching_query`/`services_matching`/`iterator_next`/`read_property`/
//! `subscribe`/`release`/`create_notification_port`/`destroy_port`) in
//! idiomatic Rust terms: `Vec<ServiceHandle>` stands in for the raw
//! `iterator_next(iter) -> Handle | 0` loop, since every caller in this
//! crate drains a registry iterator fully before acting on it anyway.

use std::time::Duration;

use crate::error::Error;

#[cfg(target_os = "macos")]
pub mod iokit;

pub mod fake;

/// A dictionary used to match services in the registry, e.g. "all
/// `IOUSBDevice` services".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchDict {
    /// The registry class name being matched, e.g. `IOUSBDevice`.
    pub class_name: String,
}

/// Dynamically-typed property value, as read from the registry.
///
/// `spec.md` §9: "the core accepts only `u16`/`u8`/`u32`/string, rejects any
/// other runtime type as `MissingProperty`, and never attempts implicit
/// coercion."
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// An 8-bit unsigned integer property.
    U8(u8),
    /// A 16-bit unsigned integer property.
    U16(u16),
    /// A 32-bit unsigned integer property.
    U32(u32),
    /// A string property.
    Str(String),
}

impl PropertyValue {
    /// Coerce to `u8`, with no implicit widening/narrowing across types.
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            PropertyValue::U8(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerce to `u16`.
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            PropertyValue::U16(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerce to `u32`.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerce to `&str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Opaque handle to a registry service entry. Obtained from
/// [`RegistryCapability::services_matching`] or a notification subscription.
/// Exactly one [`RegistryCapability::release`] call is owed per handle
/// obtained from the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(pub u64);

/// Opaque handle to a live notification port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationPortHandle(pub u64);

/// Which notification stream a subscription is for (`spec.md` §4.3: "two
/// subscriptions (first-match and terminated)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Fires once per service the first time it matches the dictionary.
    FirstMatch,
    /// Fires once per service when it is removed from the registry.
    Terminated,
}

/// Capability interface over the host USB registry (C1).
pub trait RegistryCapability: Send + Sync {
    /// Build a match dictionary for the given registry class name.
    fn matching_query(&self, class_name: &str) -> MatchDict;

    /// Enumerate the services currently matching `dict`, fully drained.
    fn services_matching(&self, dict: &MatchDict) -> Result<Vec<ServiceHandle>, Error>;

    /// Read a property from a service handle. Returns `Ok(None)` if the
    /// registry has no such property (the caller decides whether that is
    /// fatal). Property reads on a handle whose underlying device has
    /// detached fail with [`Error::NotAvailable`] rather than `Ok(None)`.
    fn read_property(
        &self,
        handle: ServiceHandle,
        key: &str,
    ) -> Result<Option<PropertyValue>, Error>;

    /// Allocate a fresh notification port.
    fn create_notification_port(&self) -> Result<NotificationPortHandle, Error>;

    /// Register a subscription of `kind` against `dict` on `port`, and
    /// return the handles pending for it right now ("already-connected
    /// drain", `spec.md` §4.3) — for `FirstMatch`, every already-attached
    /// matching service; for `Terminated`, normally empty. After this call
    /// the subscription is armed to deliver only *future* events, observed
    /// via [`RegistryCapability::wait_for_notification`] +
    /// [`RegistryCapability::drain`].
    fn subscribe(
        &self,
        port: NotificationPortHandle,
        kind: NotificationKind,
        dict: &MatchDict,
    ) -> Result<Vec<ServiceHandle>, Error>;

    /// Block the calling thread until `port` has at least one pending
    /// notification of any kind, or `timeout` elapses. Returns `true` if
    /// there is a pending event to drain.
    fn wait_for_notification(&self, port: NotificationPortHandle, timeout: Duration) -> bool;

    /// Drain events pending for one subscription since the last drain (or
    /// since [`RegistryCapability::subscribe`], for the first call).
    fn drain(&self, port: NotificationPortHandle, kind: NotificationKind) -> Vec<ServiceHandle>;

    /// Tear down a notification port and every subscription registered on
    /// it.
    fn destroy_port(&self, port: NotificationPortHandle);

    /// Release a service handle. Exactly one call per handle obtained from
    /// this capability.
    fn release(&self, handle: ServiceHandle);
}
