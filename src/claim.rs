//! The external claim oracle consumed (not decided) by this crate.

use crate::device::DeviceIdentity;

/// Predicate answering whether `device` is currently claimed for this agent's
/// exclusive use.
///
/// Claim policy (who may claim, when claims expire, ...) lives entirely
/// outside this crate, in the privileged device-claim helper described in
/// `spec.md` §1. This crate only ever reads the answer.
pub trait ClaimOracle: Send + Sync {
    /// Returns `true` if `device` is claimed.
    fn is_claimed(&self, device: &DeviceIdentity) -> bool;
}

/// A [`ClaimOracle`] useful for tests: claims exactly the identities it was
/// told to, mutable behind a shared reference so it can sit inside an `Arc`.
#[derive(Debug, Default)]
pub struct StaticClaimOracle {
    claimed: std::sync::Mutex<std::collections::HashSet<DeviceIdentity>>,
}

impl StaticClaimOracle {
    /// An oracle that claims nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// An oracle that claims exactly `devices`.
    pub fn claiming(devices: impl IntoIterator<Item = DeviceIdentity>) -> Self {
        Self {
            claimed: std::sync::Mutex::new(devices.into_iter().collect()),
        }
    }

    /// Mark `device` as claimed.
    pub fn claim(&self, device: DeviceIdentity) {
        self.claimed.lock().unwrap().insert(device);
    }

    /// Mark `device` as no longer claimed.
    pub fn release(&self, device: &DeviceIdentity) {
        self.claimed.lock().unwrap().remove(device);
    }
}

impl ClaimOracle for StaticClaimOracle {
    fn is_claimed(&self, device: &DeviceIdentity) -> bool {
        self.claimed.lock().unwrap().contains(device)
    }
}
