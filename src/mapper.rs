//! Error Mapper (C2, `spec.md` §4.2): translates a raw IOKit/registry return
//! code into the structured taxonomy of §3 plus a [`RecoveryHint`] and
//! observability [`CategoryTag`].
//!
//! Grounded in the teacher's own per-platform "raw code -> taxonomy" match
//! arms (`platform/linux_usbfs/transfer.rs`'s `Errno -> TransferStatus`
//! match, `platform/macos_iokit/iokit.rs`'s `check_iokit_return`), generalized
//! from a handful of ad hoc arms into the full, closed mapping §4.2 requires.

use io_kit_sys::ret::{
    kIOReturnAborted, kIOReturnBadArgument, kIOReturnBusy, kIOReturnCannotLock,
    kIOReturnCannotWire, kIOReturnDeviceError, kIOReturnExclusiveAccess, kIOReturnLockedRead,
    kIOReturnLockedWrite, kIOReturnNoChannels, kIOReturnNoDevice, kIOReturnNoFrames,
    kIOReturnNoMedia, kIOReturnNoMemory, kIOReturnNoPower, kIOReturnNoResources,
    kIOReturnNoSpace, kIOReturnNotAttached, kIOReturnNotOpen, kIOReturnNotPermitted,
    kIOReturnNotResponding, kIOReturnOverrun, kIOReturnSuccess, kIOReturnTimeout,
    kIOReturnUnderrun, kIOReturnUnsupported, IOReturn,
};

use crate::error::{CategoryTag, Error, ErrorContext, RecoveryHint};

/// Map a raw registry/kernel return code to the structured taxonomy.
///
/// This is the sole place that knows about IOKit's flat `IOReturn` space;
/// everything above it deals only in [`Error`].
pub fn map(code: IOReturn, ctx: &ErrorContext) -> (Error, RecoveryHint, CategoryTag) {
    #![allow(non_upper_case_globals)]
    match code {
        kIOReturnSuccess => {
            // Should not occur: callers only invoke the mapper on failure.
            (
                Error::TransferFailed,
                RecoveryHint::unrecoverable(),
                CategoryTag::UnknownError,
            )
        }

        kIOReturnNoDevice | kIOReturnNotResponding | kIOReturnNotAttached => (
            Error::NotAvailable,
            RecoveryHint::unrecoverable(),
            CategoryTag::NotFound,
        ),

        kIOReturnNotOpen | kIOReturnNotPermitted | kIOReturnExclusiveAccess => (
            Error::NotClaimed(ctx.device_id.clone().unwrap_or_else(|| "unknown".into())),
            RecoveryHint::unrecoverable(),
            CategoryTag::AccessDenied,
        ),

        kIOReturnNoMemory | kIOReturnNoResources | kIOReturnNoSpace | kIOReturnBusy
        | kIOReturnCannotWire | kIOReturnCannotLock | kIOReturnLockedRead
        | kIOReturnLockedWrite | kIOReturnNoChannels | kIOReturnNoPower => (
            Error::TooManyRequests,
            RecoveryHint {
                recoverable: true,
                base_delay_ms: Some(100),
                max_retries: resource_shortage_retries(code),
                user_action: None,
                system_action: Some("retrying with exponential backoff"),
            },
            if code == kIOReturnBusy {
                CategoryTag::DeviceBusy
            } else {
                CategoryTag::ResourceShortage
            },
        ),

        kIOReturnTimeout => (
            Error::Timeout,
            RecoveryHint::retry(100, 3),
            CategoryTag::Timeout,
        ),

        kIOReturnAborted => (
            Error::Cancelled,
            RecoveryHint::unrecoverable(),
            CategoryTag::AccessDenied,
        ),

        kIOReturnBadArgument => (
            Error::InvalidParameters,
            RecoveryHint::unrecoverable(),
            CategoryTag::InvalidParameter,
        ),

        kIOReturnUnsupported => {
            if let Some(endpoint) = ctx.endpoint {
                (
                    Error::EndpointNotFound(endpoint),
                    RecoveryHint::unrecoverable(),
                    CategoryTag::NotFound,
                )
            } else {
                (
                    Error::InvalidParameters,
                    RecoveryHint::unrecoverable(),
                    CategoryTag::InvalidParameter,
                )
            }
        }

        kIOReturnOverrun | kIOReturnUnderrun | kIOReturnDeviceError | kIOReturnNoFrames
        | kIOReturnNoMedia => (
            Error::TransferFailed,
            RecoveryHint::unrecoverable(),
            CategoryTag::IoKitError,
        ),

        other => (
            Error::RegistryError {
                code: other as u32,
                message: ctx.describe(),
            },
            RecoveryHint::unrecoverable(),
            CategoryTag::UnknownError,
        ),
    }
}

/// Subclasses of resource shortage get 3-5 retries depending on severity, per
/// `spec.md` §4.2 ("up to 3-5 retries depending on subclass"). Plain
/// busy/no-resources is the common, usually-transient case and gets the full
/// budget; lock contention and wiring failures are rarer and get fewer.
fn resource_shortage_retries(code: IOReturn) -> u32 {
    #![allow(non_upper_case_globals)]
    match code {
        kIOReturnBusy | kIOReturnNoResources | kIOReturnNoMemory => 5,
        kIOReturnNoSpace | kIOReturnNoPower => 4,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_absent_maps_to_not_available() {
        let ctx = ErrorContext::new("open");
        for code in [kIOReturnNoDevice, kIOReturnNotResponding, kIOReturnNotAttached] {
            let (err, hint, _) = map(code, &ctx);
            assert!(matches!(err, Error::NotAvailable));
            assert!(!hint.recoverable);
        }
    }

    #[test]
    fn access_errors_carry_device_id() {
        let ctx = ErrorContext::new("open").with_device("20:16");
        let (err, _, tag) = map(kIOReturnExclusiveAccess, &ctx);
        assert!(matches!(err, Error::NotClaimed(id) if id == "20:16"));
        assert_eq!(tag.as_str(), "access_denied");
    }

    #[test]
    fn access_errors_default_device_id_to_unknown() {
        let ctx = ErrorContext::new("open");
        let (err, ..) = map(kIOReturnNotPermitted, &ctx);
        assert!(matches!(err, Error::NotClaimed(id) if id == "unknown"));
    }

    #[test]
    fn busy_is_recoverable_with_backoff() {
        let ctx = ErrorContext::new("transfer");
        let (err, hint, tag) = map(kIOReturnBusy, &ctx);
        assert!(matches!(err, Error::TooManyRequests));
        assert!(hint.recoverable);
        assert_eq!(hint.max_retries, 5);
        assert_eq!(tag.as_str(), "device_busy");
    }

    #[test]
    fn timeout_maps_with_short_retry_budget() {
        let ctx = ErrorContext::new("transfer");
        let (err, hint, tag) = map(kIOReturnTimeout, &ctx);
        assert!(matches!(err, Error::Timeout));
        assert_eq!(hint.max_retries, 3);
        assert_eq!(tag.as_str(), "timeout");
    }

    #[test]
    fn unsupported_promotes_to_endpoint_not_found_when_endpoint_set() {
        let ctx = ErrorContext::new("transfer").with_endpoint(0x81);
        let (err, ..) = map(kIOReturnUnsupported, &ctx);
        assert!(matches!(err, Error::EndpointNotFound(0x81)));
    }

    #[test]
    fn unsupported_without_endpoint_is_invalid_parameters() {
        let ctx = ErrorContext::new("transfer");
        let (err, ..) = map(kIOReturnUnsupported, &ctx);
        assert!(matches!(err, Error::InvalidParameters));
    }

    #[test]
    fn success_code_while_mapping_is_transfer_failed() {
        let ctx = ErrorContext::new("transfer");
        let (err, hint, _) = map(kIOReturnSuccess, &ctx);
        assert!(matches!(err, Error::TransferFailed));
        assert!(!hint.recoverable);
    }

    #[test]
    fn unrecognized_code_preserves_raw_value() {
        let ctx = ErrorContext::new("transfer").with_device("1:1");
        let weird_code: IOReturn = 0x1234_5678;
        let (err, ..) = map(weird_code, &ctx);
        match err {
            Error::RegistryError { code, .. } => assert_eq!(code, weird_code as u32),
            other => panic!("expected RegistryError, got {other:?}"),
        }
    }

    /// P4: for every code in this representative union, mapping terminates
    /// with a taxonomy value and never panics.
    #[test]
    fn mapping_is_total_over_known_codes() {
        let codes = [
            kIOReturnSuccess,
            kIOReturnNoDevice,
            kIOReturnNotResponding,
            kIOReturnNotAttached,
            kIOReturnNotOpen,
            kIOReturnNotPermitted,
            kIOReturnExclusiveAccess,
            kIOReturnNoMemory,
            kIOReturnNoResources,
            kIOReturnBusy,
            kIOReturnCannotWire,
            kIOReturnTimeout,
            kIOReturnAborted,
            kIOReturnBadArgument,
            kIOReturnUnsupported,
            kIOReturnOverrun,
            kIOReturnUnderrun,
            kIOReturnDeviceError,
            -999999,
            i32::MIN,
            i32::MAX,
        ];
        let ctx = ErrorContext::new("op");
        for code in codes {
            let _ = map(code, &ctx);
        }
    }
}
