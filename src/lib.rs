//! libcapsule: load a shared library and its dependency tree from an
//! alternate filesystem prefix into a private dynamic-linker namespace,
//! then rewrite the Global Offset Tables of every other loaded shared
//! object so calls to its exports are routed into the isolated copy.
//!
//! A host process linked against stub "proxy" libraries uses this so a
//! real implementation under a non-standard prefix (e.g. `/host/usr/lib`)
//! can be bound at runtime without polluting the default namespace or
//! colliding with the stub's own soname.
//!
//! # Examples
//! ```no_run
//! use capsule::config;
//!
//! let flags = config::debug_flags();
//! if flags.contains(config::DebugFlags::RELOC) {
//!     log::debug!("relocation tracing enabled");
//! }
//! ```

pub mod capsule;
pub mod capture;
pub mod comparator;
pub mod config;
pub mod elf;
pub mod error;
pub mod intercept;
pub mod ldcache;
pub mod maps;
pub mod namespace;
pub mod relocate;
pub mod resolver;

pub use error::{Error, Result};

/// Construct a capsule from a just-loaded proxy library's `capsule_meta`
/// export and register it process-wide. Called once per proxy library,
/// normally from that library's own constructor.
///
/// Aborts the process with a diagnostic on stderr if the ABI version
/// doesn't match or the metadata is otherwise unreadable, and again if the
/// capsule's initial namespace load fails: a proxy library's constructor
/// runs under the dynamic linker's own serialization, so there is no caller
/// left to hand a `Result` back to.
///
/// # Safety
/// `abi` must point at a live `capsule::CapsuleMetaAbi` whose pointer
/// fields remain valid for the call's duration; see
/// [`capsule::read_capsule_metadata`].
pub unsafe fn init_capsule(abi: *const capsule::CapsuleMetaAbi) -> capsule::CapsuleId {
    let Some(metadata) = (unsafe { capsule::read_capsule_metadata(abi) }) else {
        eprintln!("libcapsule: capsule_meta ABI version mismatch or malformed metadata, aborting");
        std::process::abort();
    };
    let soname = metadata.soname.clone();
    log::info!("registering capsule for soname {soname}");
    let mut instance = capsule::Capsule::new(metadata);
    if let Err(err) = intercept::bootstrap_capsule(&mut instance) {
        eprintln!("libcapsule: failed to load capsule for {soname}: {err}");
        std::process::abort();
    }
    capsule::register(instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_modules_are_reachable() {
        let _ = config::debug_flags();
        let _ = comparator::default_chain();
    }
}
