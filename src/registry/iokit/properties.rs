//! CoreFoundation property extraction.
//!
//! Grounded in `ktemkin-usrs`'s `backend/macos/iokit.rs`
//! (`cfstr!`/`number_from_cf_number`/`string_from_cf_string`/
//! `get_iokit_{numeric,string}_device_property`), which is the only repo in
//! the retrieval pack that actually reads `IOUSBDevice` properties out of the
//! registry rather than stubbing it — the teacher's own
//! `platform/macos_iokit/enumeration.rs` is a `todo!()` here.

use std::ffi::{c_void, CStr, CString};

use core_foundation_sys::base::CFRelease;
use core_foundation_sys::number::{kCFNumberSInt64Type, CFNumberGetValue, CFNumberRef};
use core_foundation_sys::string::{kCFStringEncodingUTF8, CFStringGetCStringPtr, CFStringRef};
use io_kit_sys::{
    kIORegistryIterateParents, kIORegistryIterateRecursively, keys::kIOServicePlane,
    types::io_registry_entry_t, IORegistryEntrySearchCFProperty, CFSTR,
};

use crate::error::Error;
use crate::registry::PropertyValue;

/// Rustified version of the `CFSTR` C macro.
macro_rules! cfstr {
    ($string:expr) => {{
        let cstr = CString::new($string).expect("property name must not contain NUL bytes");
        CFSTR(cstr.as_ptr())
    }};
}

/// Search the registry entry (and its parents, recursively) for `key` and
/// return it as whichever scalar type the registry reports. Returns
/// `Ok(None)` if the property is absent.
///
/// # Safety
/// `entry` must be a valid, retained `io_registry_entry_t`.
pub(super) unsafe fn search_property(
    entry: io_registry_entry_t,
    key: &str,
) -> Result<Option<PropertyValue>, Error> {
    let plane: *mut i8 = kIOServicePlane as *mut i8;
    let raw = IORegistryEntrySearchCFProperty(
        entry,
        plane,
        cfstr!(key),
        std::ptr::null(),
        kIORegistryIterateRecursively | kIORegistryIterateParents,
    );
    if raw.is_null() {
        return Ok(None);
    }

    // `IORegistryEntrySearchCFProperty` is a CF "Copy Rule" function: it hands
    // back a +1 reference we own and must release once we've copied its value
    // out into owned Rust data below.
    let number = number_from_cf_number(raw as CFNumberRef);
    let string = if number.is_none() {
        string_from_cf_string(raw as CFStringRef)
    } else {
        None
    };
    CFRelease(raw as *const c_void);

    if let Some(n) = number {
        return Ok(Some(number_to_property(key, n)));
    }
    if let Some(s) = string {
        return Ok(Some(PropertyValue::Str(s)));
    }
    Ok(None)
}

/// Pick the scalar width the rest of the crate expects for a given
/// registry key (`spec.md` §4.3's device/interface property tables), since
/// IOKit itself just hands back a `CFNumber` of whatever width it chose.
fn number_to_property(key: &str, value: u64) -> PropertyValue {
    match key {
        "idVendor" | "idProduct" => PropertyValue::U16(value as u16),
        "bDeviceClass" | "bDeviceSubClass" | "bDeviceProtocol" => PropertyValue::U8(value as u8),
        "locationID" | "Device Speed" => PropertyValue::U32(value as u32),
        _ => PropertyValue::U32(value as u32),
    }
}

unsafe fn number_from_cf_number(number_ref: CFNumberRef) -> Option<u64> {
    if number_ref.is_null() {
        return None;
    }
    let mut result: u64 = 0;
    let succeeded = CFNumberGetValue(
        number_ref,
        kCFNumberSInt64Type,
        &mut result as *mut u64 as *mut c_void,
    );
    succeeded.then_some(result)
}

unsafe fn string_from_cf_string(string_ref: CFStringRef) -> Option<String> {
    if string_ref.is_null() {
        return None;
    }
    let c_string = CFStringGetCStringPtr(string_ref, kCFStringEncodingUTF8);
    if c_string.is_null() {
        return None;
    }
    Some(CStr::from_ptr(c_string).to_string_lossy().to_string())
}
