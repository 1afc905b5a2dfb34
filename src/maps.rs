//! `/proc/self/maps` inventory and RELRO `mprotect` toggling.
//!
//! Reads the raw pseudo-file once and hands out typed records rather than
//! letting callers poke at bytes directly.

use crate::error::{protection_failure_error, Result};
use std::fs;

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
    pub offset: u64,
    pub path: Option<String>,
}

impl MapEntry {
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }
}

/// Snapshot of every mapped region in the current process.
pub struct MapInventory {
    pub entries: Vec<MapEntry>,
}

impl MapInventory {
    /// Parse `/proc/self/maps`. A failure here is non-fatal to the
    /// relocation engine: callers fall back to skipping RELRO-protected
    /// objects rather than treating an unreadable maps file as an error.
    pub fn snapshot() -> Result<Self> {
        let text = fs::read_to_string("/proc/self/maps")?;
        let mut entries = Vec::new();
        for line in text.lines() {
            if let Some(entry) = parse_line(line) {
                entries.push(entry);
            }
        }
        Ok(MapInventory { entries })
    }

    /// The region, if any, covering `addr`.
    pub fn region_at(&self, addr: usize) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.contains(addr))
    }
}

fn parse_line(line: &str) -> Option<MapEntry> {
    // Format: "start-end perms offset dev inode path"
    let mut fields = line.splitn(6, ' ').filter(|f| !f.is_empty());
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(|p| p.trim().to_string()).filter(|p| !p.is_empty());

    let (start_s, end_s) = range.split_once('-')?;
    let start = usize::from_str_radix(start_s, 16).ok()?;
    let end = usize::from_str_radix(end_s, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let mut chars = perms.chars();
    let read = chars.next()? == 'r';
    let write = chars.next()? == 'w';
    let exec = chars.next()? == 'x';
    let private = chars.next()? == 'p';

    Some(MapEntry {
        start,
        end,
        read,
        write,
        exec,
        private,
        offset,
        path,
    })
}

/// A region whose protection was temporarily raised so the relocator could
/// write into an otherwise-RELRO-protected GOT page, remembered so the
/// original bitmask can be restored exactly.
pub struct ProtectionGuard {
    addr: usize,
    len: usize,
    original_prot: i32,
    raised: bool,
}

impl ProtectionGuard {
    /// Ensure `[addr, addr+len)` is writable, recording the prior
    /// protection so it can be restored. `original_prot` is the caller's
    /// best knowledge of the current bitmask (from the maps snapshot);
    /// if writable already, this is a no-op and `raised` stays false so
    /// `Drop` does nothing.
    pub fn raise(addr: usize, len: usize, original_prot: i32) -> Result<Self> {
        let page_size = page_size();
        let aligned_addr = addr & !(page_size - 1);
        let aligned_len = (addr + len - aligned_addr + page_size - 1) & !(page_size - 1);

        if original_prot & libc::PROT_WRITE != 0 {
            return Ok(ProtectionGuard {
                addr: aligned_addr,
                len: aligned_len,
                original_prot,
                raised: false,
            });
        }

        let rc = unsafe {
            libc::mprotect(
                aligned_addr as *mut libc::c_void,
                aligned_len,
                original_prot | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(protection_failure_error(format!(
                "mprotect(0x{aligned_addr:x}, {aligned_len}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(ProtectionGuard {
            addr: aligned_addr,
            len: aligned_len,
            original_prot,
            raised: true,
        })
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        if !self.raised {
            return;
        }
        unsafe {
            libc::mprotect(
                self.addr as *mut libc::c_void,
                self.len,
                self.original_prot,
            );
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Translate maps permission bits into the `PROT_*` bitmask `mprotect`
/// expects.
pub fn prot_bits(entry: &MapEntry) -> i32 {
    let mut prot = libc::PROT_NONE;
    if entry.read {
        prot |= libc::PROT_READ;
    }
    if entry.write {
        prot |= libc::PROT_WRITE;
    }
    if entry.exec {
        prot |= libc::PROT_EXEC;
    }
    prot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_line() {
        let line = "7f1234560000-7f1234580000 r--p 00000000 08:01 1234  /usr/lib/libfoo.so.1";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.start, 0x7f1234560000);
        assert_eq!(entry.end, 0x7f1234580000);
        assert!(entry.read);
        assert!(!entry.write);
        assert!(!entry.exec);
        assert!(entry.private);
        assert_eq!(entry.path.as_deref(), Some("/usr/lib/libfoo.so.1"));
    }

    #[test]
    fn parses_anonymous_mapping_without_path() {
        let line = "7f1234560000-7f1234580000 rw-p 00000000 00:00 0 ";
        let entry = parse_line(line).unwrap();
        assert!(entry.path.is_none());
        assert!(entry.write);
    }

    #[test]
    fn snapshot_of_self_is_nonempty() {
        let inventory = MapInventory::snapshot().expect("maps should be readable");
        assert!(!inventory.entries.is_empty());
    }

    #[test]
    fn protection_guard_round_trips_readonly_region() {
        let page = page_size();
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(map, libc::MAP_FAILED);
        let addr = map as usize;
        {
            let _guard = ProtectionGuard::raise(addr, page, libc::PROT_READ).unwrap();
            unsafe {
                *(addr as *mut u8) = 42;
            }
        }
        // After the guard drops, the page should be read-only again: a
        // write must now fault. We only assert the protection value
        // reported by /proc/self/maps round-tripped, since actually
        // faulting would abort the test process.
        let inventory = MapInventory::snapshot().unwrap();
        let region = inventory.region_at(addr).expect("region should exist");
        assert!(region.read);
        assert!(!region.write);
        unsafe {
            libc::munmap(map, page);
        }
    }
}
