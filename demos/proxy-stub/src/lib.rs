//! Minimal proxy/shim library demonstrating the `capsule_meta` protocol: a
//! cdylib that declares the soname and exports of a target library but
//! ships no real implementation, so a host process linked against it can
//! have its calls patched into a real copy at runtime.

use std::ffi::{c_char, CStr};
use std::os::raw::c_void;

static SONAME: &CStr = c"libdemo.so.1";
static DEFAULT_PREFIX: &CStr = c"/host";
static RELOC_NAME: &CStr = c"demo_entry_point";

static RELOC_ITEM_NAMES: [*const c_char; 1] = [RELOC_NAME.as_ptr()];
static EXPORT_LIST: [*const c_char; 1] = [SONAME.as_ptr()];

#[repr(C)]
struct CapsuleMetaAbi {
    abi_version: u32,
    soname: *const c_char,
    default_prefix: *const c_char,
    exclude: *const *const c_char,
    exclude_len: usize,
    export: *const *const c_char,
    export_len: usize,
    relocation_item_names: *const *const c_char,
    relocation_item_count: usize,
    dlopen_replacement: Option<unsafe extern "C" fn(*const c_char, i32) -> *mut c_void>,
    free_replacement: Option<unsafe extern "C" fn(*mut c_void)>,
    realloc_replacement: Option<unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void>,
}

#[unsafe(no_mangle)]
pub static capsule_meta: CapsuleMetaAbi = CapsuleMetaAbi {
    abi_version: 0,
    soname: SONAME.as_ptr(),
    default_prefix: DEFAULT_PREFIX.as_ptr(),
    exclude: std::ptr::null(),
    exclude_len: 0,
    export: EXPORT_LIST.as_ptr(),
    export_len: EXPORT_LIST.len(),
    relocation_item_names: RELOC_ITEM_NAMES.as_ptr(),
    relocation_item_count: RELOC_ITEM_NAMES.len(),
    dlopen_replacement: None,
    free_replacement: None,
    realloc_replacement: None,
};

/// The stub implementation: a real copy loaded under the capsule's prefix
/// replaces every caller's GOT entry for this symbol before it is ever
/// invoked through the stub.
#[unsafe(no_mangle)]
pub extern "C" fn demo_entry_point() -> i32 {
    log::error!("demo_entry_point stub called directly: capsule relocation did not run");
    -1
}

extern "C" fn on_load() {
    env_logger_init_if_present();
    log::debug!("proxy-stub loaded, capsule_meta at {:p}", &capsule_meta as *const _);
}

fn env_logger_init_if_present() {
    // The proxy itself only needs a logger when exercised directly in
    // tests; the host process installs its own.
    #[cfg(test)]
    let _ = env_logger::try_init();
}

#[used]
#[unsafe(link_section = ".init_array")]
static ON_LOAD: extern "C" fn() = on_load;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capsule_meta_declares_abi_version_zero() {
        assert_eq!(capsule_meta.abi_version, 0);
    }

    #[test]
    fn soname_is_null_terminated_and_readable() {
        let name = unsafe { CStr::from_ptr(capsule_meta.soname) };
        assert_eq!(name.to_str().unwrap(), "libdemo.so.1");
    }

    #[test]
    fn stub_entry_point_returns_sentinel_failure() {
        assert_eq!(demo_entry_point(), -1);
    }
}
