//! The `Capsule` record: one proxied soname, its metadata, and the "seen"
//! bookkeeping the relocation engine uses to avoid double-processing an
//! object.
//!
//! A small handle struct plus a process-wide `IndexMap` registry behind a
//! `spin::RwLock`.

use crate::namespace::{self, NamespaceId};
use std::collections::HashSet;
use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicU32, Ordering};

/// One `{name, real_address, shim_address}` triple from a proxy library's
/// relocation-items table.
#[derive(Debug, Clone)]
pub struct RelocationItem {
    pub name: String,
    pub real_address: usize,
    pub shim_address: usize,
}

impl RelocationItem {
    pub fn unresolved(name: impl Into<String>) -> Self {
        RelocationItem {
            name: name.into(),
            real_address: 0,
            shim_address: 0,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.real_address != 0
    }
}

/// Metadata discovered from a proxy library's `capsule_meta` export: the
/// ABI version, the soname and default prefix, and the exclude/export/
/// relocation-items lists.
#[derive(Clone)]
pub struct CapsuleMetadata {
    pub soname: String,
    pub default_prefix: String,
    pub exclude: Vec<String>,
    pub export: Vec<String>,
    pub items: Vec<RelocationItem>,
    /// The capsule's own `dlopen` replacement, installed by the wrapper
    /// installer so the capsule's internal calls resolve under its own
    /// prefix instead of the default namespace.
    pub dlopen_replacement: Option<unsafe extern "C" fn(*const c_char, i32) -> *mut c_void>,
    pub free_replacement: Option<unsafe extern "C" fn(*mut c_void)>,
    pub realloc_replacement: Option<unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void>,
}

impl std::fmt::Debug for CapsuleMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleMetadata")
            .field("soname", &self.soname)
            .field("default_prefix", &self.default_prefix)
            .field("exclude", &self.exclude)
            .field("export", &self.export)
            .field("items", &self.items)
            .field("dlopen_replacement", &self.dlopen_replacement.is_some())
            .field("free_replacement", &self.free_replacement.is_some())
            .field("realloc_replacement", &self.realloc_replacement.is_some())
            .finish()
    }
}

/// The ABI version every `capsule_meta` symbol must declare to be
/// accepted; anything else aborts the constructor rather than risk
/// misreading a layout it wasn't built for.
pub const CAPSULE_META_ABI_VERSION: u32 = 0;

/// Mirrors the C ABI a proxy library's `capsule_meta` symbol exposes.
/// `#[repr(C)]` because this struct's layout is a cross-language contract,
/// not an internal implementation detail.
#[repr(C)]
pub struct CapsuleMetaAbi {
    pub abi_version: u32,
    pub soname: *const c_char,
    pub default_prefix: *const c_char,
    pub exclude: *const *const c_char,
    pub exclude_len: usize,
    pub export: *const *const c_char,
    pub export_len: usize,
    pub relocation_item_names: *const *const c_char,
    pub relocation_item_count: usize,
    pub dlopen_replacement: Option<unsafe extern "C" fn(*const c_char, i32) -> *mut c_void>,
    pub free_replacement: Option<unsafe extern "C" fn(*mut c_void)>,
    pub realloc_replacement: Option<unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void>,
}

/// Read a `CapsuleMetaAbi` exported by a just-loaded proxy library.
/// Returns `None` (the caller then aborts the process) if the ABI version
/// is anything but [`CAPSULE_META_ABI_VERSION`].
///
/// # Safety
/// `abi` must point at a live, fully-initialized `CapsuleMetaAbi` whose
/// string and array pointers remain valid for the call's duration.
pub unsafe fn read_capsule_metadata(abi: *const CapsuleMetaAbi) -> Option<CapsuleMetadata> {
    let abi = unsafe { &*abi };
    if abi.abi_version != CAPSULE_META_ABI_VERSION {
        return None;
    }
    let soname = unsafe { cstr_to_string(abi.soname)? };
    let default_prefix = unsafe { cstr_to_string(abi.default_prefix)? };
    let exclude = unsafe { cstr_array_to_vec(abi.exclude, abi.exclude_len) };
    let export = unsafe { cstr_array_to_vec(abi.export, abi.export_len) };
    let items = unsafe { cstr_array_to_vec(abi.relocation_item_names, abi.relocation_item_count) }
        .into_iter()
        .map(RelocationItem::unresolved)
        .collect();
    Some(CapsuleMetadata {
        soname,
        default_prefix,
        exclude,
        export,
        items,
        dlopen_replacement: abi.dlopen_replacement,
        free_replacement: abi.free_replacement,
        realloc_replacement: abi.realloc_replacement,
    })
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { std::ffi::CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

unsafe fn cstr_array_to_vec(ptr: *const *const c_char, len: usize) -> Vec<String> {
    if ptr.is_null() || len == 0 {
        return Vec::new();
    }
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    slice
        .iter()
        .filter_map(|&p| unsafe { cstr_to_string(p) })
        .collect()
}

/// A unique, monotonically increasing id assigned to each capsule as it is
/// constructed, used as the registry key instead of the soname (several
/// capsules could in principle share a soname across different prefixes).
pub type CapsuleId = u32;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// The central per-soname record: metadata plus the two "seen" sets the
/// relocation engine's two entry points (`relocate_all`/`relocate_dlopen`)
/// each maintain independently.
pub struct Capsule {
    pub id: CapsuleId,
    pub metadata: CapsuleMetadata,
    pub namespace_id: NamespaceId,
    /// Handle returned by the private-namespace `dlmopen` that loaded this
    /// capsule's target, once `intercept::bootstrap_capsule` has run.
    pub dl_handle: Option<*mut c_void>,
    /// Absolute path the target was actually loaded from, set alongside
    /// `dl_handle`.
    pub loaded_path: Option<std::path::PathBuf>,
    /// Load addresses of objects already fully relocated by `relocate_all`.
    pub seen_all: HashSet<usize>,
    /// Load addresses of objects already relocated by `relocate_dlopen`.
    pub seen_some: HashSet<usize>,
}

// `dl_handle` is an opaque handle into the dynamic linker's own bookkeeping,
// not a pointer this crate ever dereferences; safe to hand across threads
// the same way the registry it lives in already is.
unsafe impl Send for Capsule {}
unsafe impl Sync for Capsule {}

impl Capsule {
    pub fn new(metadata: CapsuleMetadata) -> Self {
        let namespace_id =
            namespace::register_capsule(&metadata.default_prefix, &metadata.exclude, &metadata.export);
        Capsule {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            metadata,
            namespace_id,
            dl_handle: None,
            loaded_path: None,
            seen_all: HashSet::new(),
            seen_some: HashSet::new(),
        }
    }

    pub fn mark_seen_all(&mut self, load_addr: usize) {
        self.seen_all.insert(load_addr);
    }

    pub fn mark_seen_some(&mut self, load_addr: usize) {
        self.seen_some.insert(load_addr);
    }

    pub fn is_seen_all(&self, load_addr: usize) -> bool {
        self.seen_all.contains(&load_addr)
    }

    pub fn is_seen_some(&self, load_addr: usize) -> bool {
        self.seen_some.contains(&load_addr)
    }

    /// Fill in every unresolved item's `real_address` by looking it up in
    /// the capsule's own namespace. `lookup` is supplied by the caller
    /// (namespace loader / libdl bindings) so this module stays free of
    /// direct `dlsym` dependence.
    pub fn resolve_items(&mut self, lookup: impl Fn(&str) -> Option<usize>) {
        for item in &mut self.metadata.items {
            if !item.is_resolved() {
                if let Some(addr) = lookup(&item.name) {
                    item.real_address = addr;
                }
            }
        }
    }
}

use indexmap::IndexMap;
use spin::{Lazy, RwLock};

static REGISTRY: Lazy<RwLock<IndexMap<CapsuleId, Capsule>>> =
    Lazy::new(|| RwLock::new(IndexMap::new()));

/// Register a freshly-constructed capsule and return its id.
pub fn register(capsule: Capsule) -> CapsuleId {
    let id = capsule.id;
    log::info!("registering capsule {id} for soname {}", capsule.metadata.soname);
    REGISTRY.write().insert(id, capsule);
    id
}

/// Run `f` against every registered capsule, in registration order — the
/// shape `external_dlsym`/`external_dlopen` need to fan a lookup or a
/// re-relocation pass out across every proxied soname.
pub fn for_each_capsule(mut f: impl FnMut(&mut Capsule)) {
    let mut registry = REGISTRY.write();
    for capsule in registry.values_mut() {
        f(capsule);
    }
}

/// Remove a capsule from the registry. Closing a capsule nulls its slot
/// rather than compacting the registry, so a `CapsuleId` never gets
/// silently reassigned to an unrelated capsule.
pub fn close(id: CapsuleId) {
    log::info!("closing capsule {id}");
    REGISTRY.write().shift_remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata(soname: &str, prefix: &str) -> CapsuleMetadata {
        CapsuleMetadata {
            soname: soname.to_string(),
            default_prefix: prefix.to_string(),
            exclude: vec!["libfoo.so.1".to_string()],
            export: vec![soname.to_string()],
            items: vec![RelocationItem::unresolved("glXSwapBuffers")],
            dlopen_replacement: None,
            free_replacement: None,
            realloc_replacement: None,
        }
    }

    #[test]
    fn new_capsule_starts_with_empty_seen_sets() {
        let capsule = Capsule::new(sample_metadata("libGL.so.1", "/test/capsule/new"));
        assert!(capsule.seen_all.is_empty());
        assert!(capsule.seen_some.is_empty());
    }

    #[test]
    fn resolve_items_fills_in_addresses_once() {
        let mut capsule = Capsule::new(sample_metadata("libGL.so.1", "/test/capsule/resolve"));
        capsule.resolve_items(|name| if name == "glXSwapBuffers" { Some(0x1000) } else { None });
        assert_eq!(capsule.metadata.items[0].real_address, 0x1000);
        // second pass must not clobber an already-resolved item
        capsule.resolve_items(|_| Some(0xdead));
        assert_eq!(capsule.metadata.items[0].real_address, 0x1000);
    }

    #[test]
    fn seen_marking_is_independent_between_all_and_some() {
        let mut capsule = Capsule::new(sample_metadata("libGL.so.1", "/test/capsule/seen"));
        capsule.mark_seen_some(0x2000);
        assert!(capsule.is_seen_some(0x2000));
        assert!(!capsule.is_seen_all(0x2000));
    }

    #[test]
    fn registry_round_trips_by_id() {
        let capsule = Capsule::new(sample_metadata("libGL.so.1", "/test/capsule/registry"));
        let id = capsule.id;
        register(capsule);
        let mut seen = false;
        for_each_capsule(|c| {
            if c.id == id {
                seen = true;
            }
        });
        assert!(seen);
        close(id);
    }
}
