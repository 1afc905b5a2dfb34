//! Dependency resolver: turns a target soname or path into an ordered list
//! of absolute paths under a filesystem prefix, following `DT_NEEDED`
//! breadth-first the way glibc's own loader would, but bounded to
//! [`DSO_LIMIT`] slots and confined to one prefix.
//!
//! Implemented as a plain append-only array walked by a frontier index
//! rather than a `VecDeque`, since slots never need to be removed, only
//! appended and cross-referenced by index.

use crate::elf::{self, Dyn, Phdr, PT_DYNAMIC};
use crate::error::{
    capacity_exceeded_error, load_failed_error, malformed_elf_error, not_found_error,
    wrong_abi_error, Result,
};
use crate::ldcache::LdCache;
use crate::namespace::NamespaceId;
use std::collections::HashSet;
use std::ffi::CString;
use std::fs;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};

/// Hard ceiling on the number of slots a single resolve may use. Not a
/// soft default: the 257th dependency is a capacity error, never a silent
/// truncation.
pub const DSO_LIMIT: usize = 256;

/// sonames that are always left to the global namespace, regardless of any
/// exclude list the caller supplies.
pub(crate) const NEVER_ENCAPSULATED: &[&str] = &[
    "libc.so.6",
    "libdl.so.2",
    "libpthread.so.0",
    "libm.so.6",
    "libresolv.so.2",
    "librt.so.1",
    "libnsl.so.1",
    "libutil.so.1",
    "libcrypt.so.1",
    "libanl.so.1",
    "libBrokenLocale.so.1",
    "libmvec.so.1",
    "libthread_db.so.1",
    "libcidn.so.1",
];

/// Directories searched, in order, for a soname the cache doesn't know
/// about, once a prefix is applied.
const WELL_KNOWN_DIRS: &[&str] = &[
    "lib64",
    "usr/lib64",
    "lib/x86_64-linux-gnu",
    "usr/lib/x86_64-linux-gnu",
    "lib",
    "usr/lib",
];

fn is_never_encapsulated(soname: &str) -> bool {
    NEVER_ENCAPSULATED.contains(&soname) || basename(soname).starts_with("ld-")
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// One slot of the bounded dependency array.
pub struct DsoNeeded {
    /// The name as the requesting object's `DT_NEEDED` entry spelled it.
    pub requested_name: String,
    /// The absolute path resolved under the prefix.
    pub resolved_path: PathBuf,
    /// Raw file contents, kept so the relocator/namespace loader can read
    /// the dynamic section without reopening the file.
    pub data: Vec<u8>,
    /// Slots that named this one as a dependency.
    pub requestors: HashSet<usize>,
    /// Number of not-yet-loaded dependencies this slot itself still has
    /// outstanding; decremented as `find_dependencies` resolves each one.
    pub depcount: usize,
}

pub struct Resolver {
    pub prefix: PathBuf,
    pub exclude: HashSet<String>,
    pub elf_class: u8,
    pub elf_machine: u16,
    cache: Option<LdCache>,
    pub slots: Vec<DsoNeeded>,
}

impl Resolver {
    /// `init`: records the caller's own ELF class/machine so later opens can
    /// be rejected with `WrongAbi` on mismatch.
    pub fn init(exclude: impl IntoIterator<Item = String>, prefix: impl Into<PathBuf>) -> Self {
        let (elf_class, elf_machine) = current_process_abi();
        Resolver {
            prefix: prefix.into(),
            exclude: exclude.into_iter().collect(),
            elf_class,
            elf_machine,
            cache: None,
            slots: Vec::new(),
        }
    }

    /// `load_cache`: read and parse `/etc/ld.so.cache` (or an overridden
    /// path), tolerating its absence — callers fall back to well-known
    /// directory search.
    pub fn load_cache(&mut self, cache_path: &str) -> Result<()> {
        self.cache = Some(LdCache::load(cache_path)?);
        Ok(())
    }

    fn resolve_under_prefix(&self, soname: &str) -> Option<PathBuf> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(soname) {
                let rebased = rebase_under_prefix(&self.prefix, &hit.path);
                if rebased.is_file() {
                    return Some(rebased);
                }
            }
        }
        for dir in WELL_KNOWN_DIRS {
            let candidate = self.prefix.join(dir).join(soname);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// `set_target`: resolve slot 0. Absolute paths are validated to stay
    /// under `prefix` (unless the prefix is trivial); bare sonames go
    /// through the cache, then well-known directories.
    pub fn set_target(&mut self, name: &str) -> Result<()> {
        let resolved = if name.starts_with('/') {
            let candidate = Path::new(name);
            if self.prefix != Path::new("/") && self.prefix != Path::new("") {
                if !candidate.starts_with(&self.prefix) {
                    return Err(not_found_error(format!(
                        "{name} is outside prefix {}",
                        self.prefix.display()
                    )));
                }
            }
            candidate.to_path_buf()
        } else {
            self.resolve_under_prefix(name)
                .ok_or_else(|| not_found_error(format!("soname {name} not found under prefix")))?
        };

        let data = fs::read(&resolved)?;
        verify_elf_header(&data, self.elf_class, self.elf_machine)?;
        log::info!("resolved target {name} to {}", resolved.display());

        self.slots.push(DsoNeeded {
            requested_name: name.to_string(),
            resolved_path: resolved,
            data,
            requestors: HashSet::new(),
            depcount: 0,
        });
        Ok(())
    }

    fn slot_index_for(&self, soname: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| basename(&s.requested_name) == basename(soname))
    }

    /// `find_dependencies`: breadth-first walk of every slot's `DT_NEEDED`
    /// tags, appending newly-discovered dependencies to the array and
    /// recording requestor bits so the namespace loader knows load order
    /// constraints.
    pub fn find_dependencies(&mut self) -> Result<()> {
        let mut frontier = 0;
        while frontier < self.slots.len() {
            let needed_names = self.collect_needed(frontier)?;
            for soname in needed_names {
                if is_never_encapsulated(&soname) || self.exclude.contains(basename(&soname)) {
                    continue;
                }
                if let Some(existing) = self.slot_index_for(&soname) {
                    self.slots[existing].requestors.insert(frontier);
                    continue;
                }
                if self.slots.len() >= DSO_LIMIT {
                    log::warn!("dependency graph for {:?} exceeds DSO_LIMIT", self.prefix);
                    return Err(capacity_exceeded_error(format!(
                        "dependency graph exceeds DSO_LIMIT ({DSO_LIMIT})"
                    )));
                }
                let resolved = self
                    .resolve_under_prefix(&soname)
                    .ok_or_else(|| not_found_error(format!("dependency {soname} not found")))?;
                log::debug!("resolved dependency {soname} to {}", resolved.display());
                let data = fs::read(&resolved)?;
                verify_elf_header(&data, self.elf_class, self.elf_machine)?;
                let new_index = self.slots.len();
                let mut requestors = HashSet::new();
                requestors.insert(frontier);
                self.slots.push(DsoNeeded {
                    requested_name: soname,
                    resolved_path: resolved,
                    data,
                    requestors,
                    depcount: 0,
                });
                self.slots[frontier].depcount += 1;
                let _ = new_index;
            }
            frontier += 1;
        }
        Ok(())
    }

    /// The `DT_NEEDED` sonames of the object at `slot`, read straight out of
    /// its already-loaded file bytes.
    ///
    /// This treats `DT_STRTAB`'s value as a plain byte offset into `data`
    /// rather than a virtual address needing segment translation, which
    /// holds for the page-aligned layouts every produced object in this
    /// crate's scope uses (`p_vaddr == p_offset` per segment); this module
    /// never actually maps the file, only reads its dynamic section.
    fn collect_needed(&self, slot: usize) -> Result<Vec<String>> {
        let data = &self.slots[slot].data;
        let dyn_ptr = locate_pt_dynamic(data)
            .ok_or_else(|| malformed_elf_error("no PT_DYNAMIC segment"))?;
        let base = data.as_ptr() as usize;
        let info = unsafe { elf::walk_dynamic(dyn_ptr, base) };
        let mut out = Vec::new();
        for &offset in &info.needed {
            if let Some(name) = unsafe { elf::read_str(info.strtab, info.strsz, offset) } {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    /// `load` order: leaves before roots, i.e. highest index first. Used by
    /// [`Resolver::load`] to decide the order it calls `dlmopen` in; exposed
    /// separately since tests check the ordering without touching the real
    /// dynamic linker.
    pub fn load_order(&self) -> Vec<&Path> {
        self.slots
            .iter()
            .rev()
            .map(|s| s.resolved_path.as_path())
            .collect()
    }

    /// `dlmopen` every resolved slot, leaves first, into `namespace_id`
    /// (`NamespaceId::New` opens a fresh private namespace; `Concrete`
    /// continues loading into one a sibling capsule already opened).
    ///
    /// The first successful open under `New` pins down the concrete `Lmid_t`
    /// glibc actually assigned, via `dlinfo(..., RTLD_DI_LMID, ...)`, and
    /// every later slot in this call opens into that same concrete id
    /// instead of asking for another fresh namespace. Since the target
    /// itself (slot 0) sorts last in `load_order`, the returned handle is
    /// its `dl_handle`.
    pub fn load(&self, namespace_id: NamespaceId, flag: i32) -> Result<(NamespaceId, *mut c_void)> {
        if self.slots.is_empty() {
            return Err(not_found_error("load called before a target was resolved"));
        }
        let mut lmid: libc::Lmid_t = match namespace_id {
            NamespaceId::New => libc::LM_ID_NEWLM,
            NamespaceId::Concrete(id) => id as libc::Lmid_t,
        };
        let mut pinned = !matches!(namespace_id, NamespaceId::New);
        let mut handle: *mut c_void = std::ptr::null_mut();

        for path in self.load_order() {
            let cpath = CString::new(path.to_string_lossy().into_owned())
                .map_err(|e| load_failed_error(format!("{path:?} has an interior NUL: {e}")))?;
            handle = unsafe { libc::dlmopen(lmid, cpath.as_ptr(), flag) };
            if handle.is_null() {
                log::warn!("dlmopen({}) returned NULL", path.display());
                return Err(load_failed_error(format!("dlmopen({}) returned NULL", path.display())));
            }
            if !pinned {
                let mut concrete: libc::Lmid_t = 0;
                let rc = unsafe {
                    libc::dlinfo(handle, libc::RTLD_DI_LMID, &mut concrete as *mut _ as *mut c_void)
                };
                if rc == 0 {
                    log::debug!("namespace for {:?} resolved to concrete id {concrete}", self.prefix);
                    lmid = concrete;
                    pinned = true;
                }
            }
        }

        let resolved_id = if matches!(namespace_id, NamespaceId::New) {
            NamespaceId::Concrete(lmid as i64)
        } else {
            namespace_id
        };
        Ok((resolved_id, handle))
    }
}

fn rebase_under_prefix(prefix: &Path, cached_path: &str) -> PathBuf {
    let relative = cached_path.strip_prefix('/').unwrap_or(cached_path);
    prefix.join(relative)
}

#[cfg(target_pointer_width = "64")]
fn current_process_abi() -> (u8, u16) {
    const ELFCLASS64: u8 = 2;
    #[cfg(target_arch = "x86_64")]
    const MACHINE: u16 = 62; // EM_X86_64
    #[cfg(target_arch = "aarch64")]
    const MACHINE: u16 = 183; // EM_AARCH64
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    const MACHINE: u16 = 0;
    (ELFCLASS64, MACHINE)
}

#[cfg(target_pointer_width = "32")]
fn current_process_abi() -> (u8, u16) {
    const ELFCLASS32: u8 = 1;
    const MACHINE: u16 = 3; // EM_386
    (ELFCLASS32, MACHINE)
}

/// Confirm `data` begins with ELF magic and matches the caller's class and
/// machine: a bad magic is `MalformedElf`, a class/machine mismatch is
/// `WrongAbi`.
fn verify_elf_header(data: &[u8], elf_class: u8, elf_machine: u16) -> Result<()> {
    if data.len() < 20 || &data[0..4] != b"\x7fELF" {
        return Err(malformed_elf_error("missing ELF magic"));
    }
    let class = data[4];
    if class != elf_class {
        return Err(wrong_abi_error(format!(
            "ELF class {class} does not match caller's {elf_class}"
        )));
    }
    let machine = u16::from_ne_bytes([data[18], data[19]]);
    if elf_machine != 0 && machine != elf_machine {
        return Err(wrong_abi_error(format!(
            "ELF machine {machine} does not match caller's {elf_machine}"
        )));
    }
    Ok(())
}

/// Find the `PT_DYNAMIC` program header in a freshly-read ELF file buffer
/// and return a pointer to its in-buffer `Dyn` array.
fn locate_pt_dynamic(data: &[u8]) -> Option<*const Dyn> {
    if data.len() < 64 {
        return None;
    }
    let e_phoff = u64::from_ne_bytes(data[32..40].try_into().ok()?) as usize;
    let e_phentsize = u16::from_ne_bytes(data[54..56].try_into().ok()?) as usize;
    let e_phnum = u16::from_ne_bytes(data[56..58].try_into().ok()?) as usize;
    for i in 0..e_phnum {
        let off = e_phoff + i * e_phentsize;
        if off + std::mem::size_of::<Phdr>() > data.len() {
            break;
        }
        let phdr = unsafe { &*(data[off..].as_ptr() as *const Phdr) };
        if phdr.p_type == PT_DYNAMIC {
            let dyn_off = phdr.p_offset as usize;
            if dyn_off >= data.len() {
                return None;
            }
            return Some(data[dyn_off..].as_ptr() as *const Dyn);
        }
    }
    None
}
