//! External interceptors: the replacements for `dlopen`/`dlsym` a host
//! process binds against once libcapsule is loaded, plus the
//! capsule-internal `dlopen` replacement installed inside each capsule's
//! private namespace.
//!
//! The shape is "try the real call first, then fall back to scanning every
//! registered capsule": search the global scope, returning the first hit,
//! before falling through to a second, capsule-scoped search.

use crate::capsule::{self, Capsule};
use crate::error::{not_found_error, Result};
use crate::namespace::NamespaceId;
use crate::relocate::{install_wrappers, relocate_all, relocate_dlopen};
use crate::resolver::Resolver;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

/// Abstraction over the handful of libc entry points this module calls
/// through, so tests can substitute a fake without touching global dlopen
/// state.
pub trait DlBindings {
    fn dlsym(&self, handle: *mut c_void, symbol: &str) -> Option<usize>;
    fn dlopen(&self, path: &str, flag: i32) -> Option<*mut c_void>;
    fn addr_to_path(&self, addr: usize) -> Option<String>;
}

/// The real libc bindings, used outside tests.
pub struct SystemDl;

impl DlBindings for SystemDl {
    fn dlsym(&self, handle: *mut c_void, symbol: &str) -> Option<usize> {
        let cname = std::ffi::CString::new(symbol).ok()?;
        let result = unsafe { libc::dlsym(handle, cname.as_ptr()) };
        if result.is_null() {
            None
        } else {
            Some(result as usize)
        }
    }

    fn dlopen(&self, path: &str, flag: i32) -> Option<*mut c_void> {
        let cpath = std::ffi::CString::new(path).ok()?;
        let result = unsafe { libc::dlopen(cpath.as_ptr(), flag) };
        if result.is_null() {
            None
        } else {
            Some(result)
        }
    }

    fn addr_to_path(&self, addr: usize) -> Option<String> {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::dladdr(addr as *const c_void, &mut info) };
        if rc == 0 || info.dli_fname.is_null() {
            return None;
        }
        Some(
            unsafe { CStr::from_ptr(info.dli_fname as *const c_char) }
                .to_string_lossy()
                .into_owned(),
        )
    }
}

/// Does `path`'s basename begin with `soname`, followed by nothing or a
/// `.`-continuation? `libFoo.so.2` matches `/a/b/libFoo.so.2.7` but not
/// `/a/b/libFoo.so.20`.
pub fn soname_matches_path(soname: &str, path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path);
    match basename.strip_prefix(soname) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// `external_dlsym`: try the unmodified call first; if it missed, or hit an
/// address inside a known capsule proxy object, scan every registered
/// capsule's own namespace for an export that matches.
pub fn external_dlsym(dl: &impl DlBindings, handle: *mut c_void, symbol: &str) -> Option<usize> {
    let direct = dl.dlsym(handle, symbol);
    let direct_is_proxy = direct
        .and_then(|addr| dl.addr_to_path(addr))
        .map(|path| is_capsule_proxy_path(&path))
        .unwrap_or(false);

    if direct.is_some() && !direct_is_proxy {
        return direct;
    }

    let mut found = None;
    capsule::for_each_capsule(|c| {
        if found.is_some() {
            return;
        }
        let Some(ns_handle) = capsule_dl_handle(c) else {
            return;
        };
        let Some(addr) = dl.dlsym(ns_handle, symbol) else {
            return;
        };
        let Some(path) = dl.addr_to_path(addr) else {
            return;
        };
        if c.metadata.export.iter().any(|soname| soname_matches_path(soname, &path)) {
            found = Some(addr);
        }
    });

    found.or(direct)
}

fn is_capsule_proxy_path(path: &str) -> bool {
    path.rsplit('/').next().unwrap_or(path).starts_with("libcapsule")
}

/// The handle `bootstrap_capsule` recorded for this capsule's private
/// namespace, if it has completed its initial `dlmopen`/`dlopen` yet.
fn capsule_dl_handle(capsule: &Capsule) -> Option<*mut c_void> {
    capsule.dl_handle
}

/// `external_dlopen`: forward to the real `dlopen`; on success, re-run both
/// relocation passes against every registered capsule since the new object
/// may carry unresolved GOT entries.
pub fn external_dlopen(dl: &impl DlBindings, path: &str, flag: i32) -> Option<*mut c_void> {
    let result = dl.dlopen(path, flag)?;
    log::debug!("external dlopen({path}) succeeded, re-running relocation passes");
    capsule::for_each_capsule(|c| {
        relocate_all(c);
        relocate_dlopen(c, 0);
    });
    Some(result)
}

/// `internal_dlopen`: the replacement installed inside a capsule's own
/// namespace. A trivial prefix delegates straight to `dlopen`; anything else
/// resolves the dependency tree under the capsule's prefix and exclude
/// list, then `dlmopen`s every resolved slot into the capsule's namespace.
/// On success, `capsule.dl_handle`/`loaded_path`/`namespace_id` are updated
/// to reflect the load.
pub fn internal_dlopen(capsule: &mut Capsule, file: &str, flag: i32) -> Result<*mut c_void> {
    if capsule.metadata.default_prefix.is_empty() || capsule.metadata.default_prefix == "/" {
        let cpath = CString::new(file)
            .map_err(|e| not_found_error(format!("{file} has an interior NUL: {e}")))?;
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), flag) };
        if handle.is_null() {
            return Err(not_found_error(format!("dlopen({file}) returned NULL")));
        }
        capsule.dl_handle = Some(handle);
        capsule.loaded_path = Some(std::path::PathBuf::from(file));
        return Ok(handle);
    }

    let mut resolver = Resolver::init(
        capsule.metadata.exclude.iter().cloned(),
        capsule.metadata.default_prefix.clone(),
    );
    resolver.set_target(file)?;
    resolver.find_dependencies()?;
    let (namespace_id, handle) = resolver.load(capsule.namespace_id, flag)?;

    if let NamespaceId::Concrete(id) = namespace_id {
        crate::namespace::set_concrete_id(&capsule.metadata.default_prefix, id);
    }
    capsule.namespace_id = namespace_id;
    capsule.dl_handle = Some(handle);
    capsule.loaded_path = resolver.slots.first().map(|slot| slot.resolved_path.clone());
    Ok(handle)
}

/// Run a capsule's initial load: `internal_dlopen` its own soname, resolve
/// every relocation item's real address via `dlsym` against the handle that
/// returned, and install the capsule's own `dlopen`/`free`/`realloc`
/// wrappers into just that DSO.
pub fn bootstrap_capsule(capsule: &mut Capsule) -> Result<()> {
    let soname = capsule.metadata.soname.clone();
    let handle = internal_dlopen(capsule, &soname, libc::RTLD_NOW)?;
    let dl = SystemDl;
    capsule.resolve_items(|name| dl.dlsym(handle, name));
    install_wrappers(capsule);
    Ok(())
}

/// `RTLD_GLOBAL` is unsupported across private namespaces; a capsule caller
/// that asks for it gets this flag stripped with a log message rather than
/// a hard error, since the cross-namespace semantics simply don't exist.
pub const RTLD_GLOBAL_UNSUPPORTED_NOTE: &str =
    "RTLD_GLOBAL has no effect on objects opened inside a capsule's private namespace";

pub fn describe_namespace(id: NamespaceId) -> String {
    match id {
        NamespaceId::New => "new".to_string(),
        NamespaceId::Concrete(n) => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::CapsuleMetadata;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeDl {
        symbols: HashMap<(usize, String), usize>,
        paths: HashMap<usize, String>,
        opens: RefCell<Vec<String>>,
    }

    impl DlBindings for FakeDl {
        fn dlsym(&self, handle: *mut c_void, symbol: &str) -> Option<usize> {
            self.symbols.get(&(handle as usize, symbol.to_string())).copied()
        }
        fn dlopen(&self, path: &str, _flag: i32) -> Option<*mut c_void> {
            self.opens.borrow_mut().push(path.to_string());
            Some(0x1 as *mut c_void)
        }
        fn addr_to_path(&self, addr: usize) -> Option<String> {
            self.paths.get(&addr).cloned()
        }
    }

    #[test]
    fn soname_matches_exact_basename() {
        assert!(soname_matches_path("libGL.so.1", "/a/b/libGL.so.1"));
    }

    #[test]
    fn soname_matches_dot_continuation() {
        assert!(soname_matches_path("libGL.so.1", "/a/b/libGL.so.1.7"));
    }

    #[test]
    fn soname_does_not_match_longer_version_without_dot() {
        assert!(!soname_matches_path("libGL.so.1", "/a/b/libGL.so.10"));
    }

    #[test]
    fn external_dlsym_prefers_direct_hit_when_not_a_proxy() {
        let mut symbols = HashMap::new();
        symbols.insert((0usize, "foo".to_string()), 0x500);
        let mut paths = HashMap::new();
        paths.insert(0x500, "/usr/lib/libreal.so.1".to_string());
        let dl = FakeDl { symbols, paths, opens: RefCell::new(Vec::new()) };
        let result = external_dlsym(&dl, std::ptr::null_mut(), "foo");
        assert_eq!(result, Some(0x500));
    }

    #[test]
    fn external_dlsym_falls_through_to_a_capsules_own_namespace() {
        let ns_handle = 0x42usize as *mut c_void;
        let mut symbols = HashMap::new();
        symbols.insert((ns_handle as usize, "glXSwapBuffers".to_string()), 0x9000);
        let mut paths = HashMap::new();
        paths.insert(0x9000, "/capsule/prefix/libGL.so.1".to_string());
        let dl = FakeDl { symbols, paths, opens: RefCell::new(Vec::new()) };

        let mut capsule = Capsule::new(CapsuleMetadata {
            soname: "libGL.so.1".to_string(),
            default_prefix: "/test/intercept/capsule-fan-out".to_string(),
            exclude: Vec::new(),
            export: vec!["libGL.so.1".to_string()],
            items: Vec::new(),
            dlopen_replacement: None,
            free_replacement: None,
            realloc_replacement: None,
        });
        capsule.dl_handle = Some(ns_handle);
        let id = capsule::register(capsule);

        let result = external_dlsym(&dl, std::ptr::null_mut(), "glXSwapBuffers");
        assert_eq!(result, Some(0x9000));
        capsule::close(id);
    }

    #[test]
    fn capsule_fan_out_is_skipped_when_no_export_matches() {
        let ns_handle = 0x43usize as *mut c_void;
        let mut symbols = HashMap::new();
        symbols.insert((ns_handle as usize, "glXSwapBuffers".to_string()), 0x9100);
        let mut paths = HashMap::new();
        paths.insert(0x9100, "/capsule/prefix/libOtherGL.so.1".to_string());
        let dl = FakeDl { symbols, paths, opens: RefCell::new(Vec::new()) };

        let mut capsule = Capsule::new(CapsuleMetadata {
            soname: "libGL.so.1".to_string(),
            default_prefix: "/test/intercept/capsule-fan-out-miss".to_string(),
            exclude: Vec::new(),
            export: vec!["libGL.so.1".to_string()],
            items: Vec::new(),
            dlopen_replacement: None,
            free_replacement: None,
            realloc_replacement: None,
        });
        capsule.dl_handle = Some(ns_handle);
        let id = capsule::register(capsule);

        let result = external_dlsym(&dl, std::ptr::null_mut(), "glXSwapBuffers");
        assert_eq!(result, None);
        capsule::close(id);
    }

    #[test]
    fn external_dlopen_relocates_after_success() {
        let dl = FakeDl {
            symbols: HashMap::new(),
            paths: HashMap::new(),
            opens: RefCell::new(Vec::new()),
        };
        let handle = external_dlopen(&dl, "/usr/lib/libnew.so.1", 0);
        assert!(handle.is_some());
        assert_eq!(dl.opens.borrow().as_slice(), &["/usr/lib/libnew.so.1".to_string()]);
    }
}
