//! The relocation engine: for every shared object loaded outside a
//! capsule's private namespace, walk its `PT_DYNAMIC` section and
//! overwrite GOT slots that reference a symbol name the capsule wants
//! redirected.
//!
//! Object enumeration calls the real libc `dl_iterate_phdr` and copies
//! each object's base/phdrs into a context `Vec` before doing any work,
//! since the callback can't be async and needs owned data to hand back.

use crate::capsule::Capsule;
use crate::elf::{
    self, classify_reloc_type, r_sym_type_64, Phdr, RelocKind, Rel, Rela, PT_DYNAMIC, PT_GNU_RELRO,
};
use crate::maps::{prot_bits, MapInventory, ProtectionGuard};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};

/// One object the system dynamic linker currently has mapped, gathered via
/// `dl_iterate_phdr`.
struct LoadedObject {
    base: usize,
    name: String,
    phdrs: Vec<Phdr>,
}

extern "C" fn collect_callback(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    let objects = unsafe { &mut *(data as *mut Vec<LoadedObject>) };
    let info = unsafe { &*info };
    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name as *const c_char) }
            .to_string_lossy()
            .into_owned()
    };
    let phdrs = if info.dlpi_phdr.is_null() || info.dlpi_phnum == 0 {
        Vec::new()
    } else {
        unsafe {
            std::slice::from_raw_parts(info.dlpi_phdr as *const Phdr, info.dlpi_phnum as usize)
        }
        .to_vec()
    };
    objects.push(LoadedObject {
        base: info.dlpi_addr as usize,
        name,
        phdrs,
    });
    0
}

fn enumerate_loaded_objects() -> Vec<LoadedObject> {
    let mut objects: Vec<LoadedObject> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_callback),
            &mut objects as *mut _ as *mut c_void,
        );
    }
    objects
}

fn own_soname() -> &'static str {
    "libcapsule.so"
}

/// Outcome of one relocation pass: slots actually written, and slots that
/// were supposed to be written but failed (RELRO without a maps snapshot,
/// or `mprotect` failure).
#[derive(Debug, Default, Clone, Copy)]
pub struct RelocationStats {
    pub written: usize,
    pub failed: usize,
}

impl RelocationStats {
    pub fn is_success(&self) -> bool {
        self.written > 0 || self.failed == 0
    }
}

/// `relocate_all`: rewrite every item in the capsule's full table across
/// every object outside the capsule, skipping libcapsule itself and
/// anything already in `seen_all`.
pub fn relocate_all(capsule: &mut Capsule) -> RelocationStats {
    let items: Vec<(String, usize, usize)> = capsule
        .metadata
        .items
        .iter()
        .filter(|i| i.is_resolved())
        .map(|i| (i.name.clone(), i.real_address, i.shim_address))
        .collect();
    run_pass(capsule, &items, false)
}

/// `relocate_dlopen`: the fixed one-entry table redirecting `dlopen` into
/// the external wrapper, skipping libc/libdl/libpthread in addition to the
/// capsule itself, using the independent `seen_some` set.
pub fn relocate_dlopen(capsule: &mut Capsule, dlopen_shim_target: usize) -> RelocationStats {
    let items = vec![("dlopen".to_string(), dlopen_shim_target, 0usize)];
    run_pass(capsule, &items, true)
}

fn run_pass(capsule: &mut Capsule, items: &[(String, usize, usize)], dlopen_pass: bool) -> RelocationStats {
    let maps = MapInventory::snapshot().ok();
    let mut stats = RelocationStats::default();
    let objects = enumerate_loaded_objects();

    for object in objects {
        if object.name.ends_with(own_soname()) {
            continue;
        }
        let already_seen = if dlopen_pass {
            capsule.is_seen_some(object.base)
        } else {
            capsule.is_seen_all(object.base)
        };
        if already_seen {
            continue;
        }
        if dlopen_pass && is_libc_family(&object.name) {
            continue;
        }

        match relocate_one_object(&object, items, maps.as_ref()) {
            Some(object_stats) => {
                if object_stats.written > 0 {
                    log::debug!("rewrote {} slot(s) in {}", object_stats.written, object.name);
                }
                stats.written += object_stats.written;
                stats.failed += object_stats.failed;
            }
            None => {
                log::debug!("{} has no readable PT_DYNAMIC, skipping", object.name);
                continue;
            }
        }

        if dlopen_pass {
            capsule.mark_seen_some(object.base);
        } else {
            capsule.mark_seen_all(object.base);
        }
    }
    log::info!(
        "capsule {} pass complete: {} written, {} failed",
        capsule.id,
        stats.written,
        stats.failed
    );
    stats
}

/// `install_wrappers`: the wrapper installer. Unlike `relocate_all`/
/// `relocate_dlopen`, which rewrite every *other* loaded object, this pass
/// is scoped to exactly the capsule's own DSO (`capsule.loaded_path`) and
/// redirects its internal `dlopen`/`free`/`realloc` calls to the
/// replacements a proxy library supplied in its `capsule_meta`. A capsule
/// with no loaded path yet, or no replacements configured, is a no-op.
pub fn install_wrappers(capsule: &Capsule) -> RelocationStats {
    let Some(loaded_path) = &capsule.loaded_path else {
        return RelocationStats::default();
    };
    let mut items = Vec::new();
    if let Some(f) = capsule.metadata.dlopen_replacement {
        items.push(("dlopen".to_string(), 0usize, f as usize));
    }
    if let Some(f) = capsule.metadata.free_replacement {
        items.push(("free".to_string(), 0usize, f as usize));
    }
    if let Some(f) = capsule.metadata.realloc_replacement {
        items.push(("realloc".to_string(), 0usize, f as usize));
    }
    if items.is_empty() {
        return RelocationStats::default();
    }
    // Reuse the (real_address, shim_address) slots as (shim, unused): the
    // wrapper installer always writes the replacement address regardless of
    // what is currently there, so `real_address` below carries the
    // replacement and RELRO-unmapped detection (which compares against
    // `shim_address`) never matches.
    let items: Vec<(String, usize, usize)> = items
        .into_iter()
        .map(|(name, _, shim)| (name, shim, usize::MAX))
        .collect();

    let maps = MapInventory::snapshot().ok();
    let loaded_path_str = loaded_path.to_string_lossy().into_owned();
    let stats = enumerate_loaded_objects()
        .into_iter()
        .find(|object| object.name == loaded_path_str)
        .and_then(|object| relocate_one_object(&object, &items, maps.as_ref()))
        .unwrap_or_default();
    log::info!(
        "wrapper installer for capsule {}: {} written, {} failed",
        capsule.id,
        stats.written,
        stats.failed
    );
    stats
}

fn is_libc_family(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.starts_with("libc.so") || base.starts_with("libdl.so") || base.starts_with("libpthread.so")
}

/// Walk one object's `PT_DYNAMIC` and rewrite any matching GOT slot.
/// Returns `None` if the object carries no readable `PT_DYNAMIC` segment.
fn relocate_one_object(
    object: &LoadedObject,
    items: &[(String, usize, usize)],
    maps: Option<&MapInventory>,
) -> Option<RelocationStats> {
    let dyn_phdr = object.phdrs.iter().find(|p| p.p_type == PT_DYNAMIC)?;
    let dyn_ptr = (object.base + dyn_phdr.p_vaddr as usize) as *const elf::Dyn;
    let info = unsafe { elf::walk_dynamic(dyn_ptr, object.base) };
    let symtab = unsafe { elf::symtab_slice(&info) };

    let relro = object.phdrs.iter().find(|p| p.p_type == PT_GNU_RELRO);
    let mut guard: Option<ProtectionGuard> = None;
    if let (Some(relro), Some(maps)) = (relro, maps) {
        let addr = object.base + relro.p_vaddr as usize;
        let original_prot = maps
            .region_at(addr)
            .map(prot_bits)
            .unwrap_or(libc::PROT_READ);
        guard = ProtectionGuard::raise(addr, relro.p_memsz as usize, original_prot).ok();
    }
    let relro_unmapped = relro.is_some() && guard.is_none() && maps.is_none();

    let mut stats = RelocationStats::default();

    let jmprel_entsize = if info.pltrel_is_rela {
        std::mem::size_of::<Rela>()
    } else {
        std::mem::size_of::<Rel>()
    };
    let tables: [(usize, bool, usize); 3] = [
        (info.jmprel, info.pltrel_is_rela, jmprel_entsize),
        (info.rela, true, info.relaent.max(std::mem::size_of::<Rela>())),
        (info.rel, false, info.relent.max(std::mem::size_of::<Rel>())),
    ];
    let sizes = [info.pltrelsz, info.relasz, info.relsz];

    for (idx, (table, is_rela, entsize)) in tables.into_iter().enumerate() {
        if table == 0 || entsize == 0 {
            continue;
        }
        let count = sizes[idx] / entsize;
        for i in 0..count {
            let (r_info, r_offset, r_addend) = unsafe {
                if is_rela {
                    let entry = &*((table + i * entsize) as *const Rela);
                    (entry.r_info, entry.r_offset, entry.r_addend)
                } else {
                    let entry = &*((table + i * entsize) as *const Rel);
                    (entry.r_info, entry.r_offset, 0i64)
                }
            };
            let (sym_idx, r_type) = r_sym_type_64(r_info);
            let kind = classify_reloc_type(r_type);
            if !matches!(kind, RelocKind::JumpSlot | RelocKind::GlobDat | RelocKind::Direct) {
                continue;
            }
            let Some(sym) = symtab.get(sym_idx as usize) else {
                continue;
            };
            let Some(sym_name) = (unsafe { elf::read_str(info.strtab, info.strsz, sym.st_name as usize) }) else {
                continue;
            };
            if sym_name.is_empty() {
                continue;
            }
            let Some((_, real_address, shim_address)) = items.iter().find(|(name, _, _)| name == sym_name) else {
                continue;
            };

            let slot_addr = if is_rela {
                (object.base as i64 + r_offset as i64 + r_addend) as usize
            } else {
                object.base + r_offset as usize
            };
            let slot = slot_addr as *mut usize;
            let current = unsafe { *slot };

            if current == *real_address {
                continue; // already correct: idempotent no-op
            }
            if relro_unmapped && current == *shim_address {
                stats.failed += 1;
                continue;
            }
            unsafe {
                *slot = *real_address;
            }
            stats.written += 1;
        }
    }

    drop(guard);
    Some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_success_when_nothing_failed() {
        let stats = RelocationStats { written: 0, failed: 0 };
        assert!(stats.is_success());
    }

    #[test]
    fn stats_failure_when_all_slots_failed() {
        let stats = RelocationStats { written: 0, failed: 3 };
        assert!(!stats.is_success());
    }

    #[test]
    fn stats_success_when_some_slots_written_despite_failures() {
        let stats = RelocationStats { written: 1, failed: 1 };
        assert!(stats.is_success());
    }

    #[test]
    fn libc_family_detection_matches_basename() {
        assert!(is_libc_family("/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(is_libc_family("/lib/x86_64-linux-gnu/libpthread.so.0"));
        assert!(!is_libc_family("/usr/lib/libGL.so.1"));
    }

    #[test]
    fn enumerate_loaded_objects_finds_the_running_process() {
        let objects = enumerate_loaded_objects();
        assert!(!objects.is_empty());
    }
}
