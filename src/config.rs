//! Environment-driven configuration: `CAPSULE_DEBUG`, `CAPSULE_PREFIX`,
//! `CAPSULE_<SONAME>_PREFIX`.
//!
//! A public bitflags struct plus a handful of free functions that parse
//! process state once.

use bitflags::bitflags;
use std::env;

bitflags! {
    /// Subsystems named by `CAPSULE_DEBUG`. `ALL` is the union of every
    /// other bit, matching the `all` token in the environment variable's
    /// grammar.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        const PATH     = 1 << 0;
        const SEARCH   = 1 << 1;
        const LDCACHE  = 1 << 2;
        const CAPSULE  = 1 << 3;
        const MPROTECT = 1 << 4;
        const WRAPPERS = 1 << 5;
        const RELOC    = 1 << 6;
        const ELF      = 1 << 7;
        const DLFUNC   = 1 << 8;
    }
}

impl DebugFlags {
    fn token(name: &str) -> Option<Self> {
        match name {
            "path" => Some(Self::PATH),
            "search" => Some(Self::SEARCH),
            "ldcache" => Some(Self::LDCACHE),
            "capsule" => Some(Self::CAPSULE),
            "mprotect" => Some(Self::MPROTECT),
            "wrappers" => Some(Self::WRAPPERS),
            "reloc" => Some(Self::RELOC),
            "elf" => Some(Self::ELF),
            "dlfunc" => Some(Self::DLFUNC),
            "all" => Some(Self::all()),
            _ => None,
        }
    }

    /// Parse a `CAPSULE_DEBUG`-shaped string: tokens separated by spaces
    /// and/or commas, unknown tokens silently ignored (matches the C
    /// implementation's forgiving parser).
    pub fn parse(value: &str) -> Self {
        let mut flags = Self::empty();
        for token in value.split([',', ' ']).filter(|t| !t.is_empty()) {
            if let Some(bit) = Self::token(token) {
                flags |= bit;
            }
        }
        flags
    }
}

/// True when the current process must ignore `CAPSULE_DEBUG` because it is
/// running under altered privilege (setuid/setgid, or `AT_SECURE` set by the
/// kernel). Reads the `AT_SECURE` word out of `/proc/self/auxv` directly,
/// the same pseudo-file `AT_PHDR`/`AT_PHNUM`/`AT_BASE` live in.
pub fn is_untrusted_process() -> bool {
    const AT_SECURE: u64 = 23;
    let Ok(data) = std::fs::read("/proc/self/auxv") else {
        // Cannot determine: behave conservatively and treat as untrusted.
        return true;
    };
    let word = std::mem::size_of::<u64>();
    for chunk in data.chunks_exact(word * 2) {
        let tag = u64::from_ne_bytes(chunk[..word].try_into().unwrap());
        let val = u64::from_ne_bytes(chunk[word..].try_into().unwrap());
        if tag == 0 {
            break;
        }
        if tag == AT_SECURE {
            return val != 0;
        }
    }
    false
}

/// Read and parse `CAPSULE_DEBUG`, honoring the untrusted-process rule:
/// an empty flag set whenever the calling process runs under altered
/// privilege.
pub fn debug_flags() -> DebugFlags {
    if is_untrusted_process() {
        return DebugFlags::empty();
    }
    env::var("CAPSULE_DEBUG")
        .map(|v| DebugFlags::parse(&v))
        .unwrap_or(DebugFlags::empty())
}

/// Uppercase `soname` and replace every non-alphanumeric byte with `_`, the
/// transform `CAPSULE_<SONAME>_PREFIX` applies to a soname to build its
/// environment variable name.
pub fn soname_env_key(soname: &str) -> String {
    let mut key = String::with_capacity("CAPSULE_".len() + soname.len() + "_PREFIX".len());
    key.push_str("CAPSULE_");
    for b in soname.bytes() {
        if b.is_ascii_alphanumeric() {
            key.push(b.to_ascii_uppercase() as char);
        } else {
            key.push('_');
        }
    }
    key.push_str("_PREFIX");
    key
}

/// Resolve the effective prefix for `soname`: a per-soname
/// `CAPSULE_<SONAME>_PREFIX` override if set, else `CAPSULE_PREFIX`, else
/// `fallback` (the proxy's own compiled-in default prefix).
pub fn resolve_prefix(soname: &str, fallback: &str) -> String {
    if let Ok(v) = env::var(soname_env_key(soname)) {
        return v;
    }
    if let Ok(v) = env::var("CAPSULE_PREFIX") {
        return v;
    }
    fallback.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tokens() {
        let flags = DebugFlags::parse("path,reloc mprotect");
        assert!(flags.contains(DebugFlags::PATH));
        assert!(flags.contains(DebugFlags::RELOC));
        assert!(flags.contains(DebugFlags::MPROTECT));
        assert!(!flags.contains(DebugFlags::ELF));
    }

    #[test]
    fn all_token_sets_every_bit() {
        assert_eq!(DebugFlags::parse("all"), DebugFlags::all());
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        assert_eq!(DebugFlags::parse("bogus,path,nonsense"), DebugFlags::PATH);
    }

    #[test]
    fn soname_key_uppercases_and_escapes() {
        assert_eq!(soname_env_key("libGL.so.1"), "CAPSULE_LIBGL_SO_1_PREFIX");
    }
}
