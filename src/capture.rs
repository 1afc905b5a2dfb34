//! Capture tool core: compiles the pattern-language tokens into resolved
//! soname targets, decides (via [`crate::comparator`]) whether the
//! provider's copy should be preferred, and builds a plan of symlinks to
//! create.
//!
//! The token compiler is a small hand-written recursive-descent-free
//! tokenizer/dispatcher in the same flat `match`-over-prefix style the
//! teacher uses for its own small string-keyed dispatch
//! (`config::DebugFlags::token`, generalized here to the richer
//! `prefix:value` grammar the capture tool's patterns need).

use crate::comparator::{run_chain, Comparator, LibraryFacts, LibraryKnowledge, Verdict};
use crate::error::{path_escape_error, Result};
use std::path::{Path, PathBuf};

/// One compiled pattern token. `Bare` is a positional soname/path guess;
/// every other variant is an explicit `prefix:value` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Soname(String),
    ExactSoname(String),
    SonameMatch(String),
    Path(PathBuf),
    PathMatch(String),
    IfExists(Box<Pattern>),
    IfSameAbi(Box<Pattern>),
    EvenIfOlder(Box<Pattern>),
    OnlyDependencies(Box<Pattern>),
    NoDependencies(Box<Pattern>),
    Gl,
    Nvidia,
    Bare(String),
}

/// Parse one whitespace-separated token into a [`Pattern`]. Modifier
/// prefixes (`if-exists:`, `if-same-abi:`, `even-if-older:`,
/// `only-dependencies:`, `no-dependencies:`) wrap whatever pattern follows
/// the colon, recursively, so `even-if-older:if-exists:soname:libGL.so.1`
/// parses as `EvenIfOlder(IfExists(Soname("libGL.so.1")))`.
pub fn parse_token(token: &str) -> Pattern {
    for (prefix, wrap) in MODIFIER_PREFIXES {
        if let Some(rest) = token.strip_prefix(prefix) {
            return wrap(Box::new(parse_token(rest)));
        }
    }
    if let Some(rest) = token.strip_prefix("soname:") {
        return Pattern::Soname(rest.to_string());
    }
    if let Some(rest) = token.strip_prefix("exact-soname:") {
        return Pattern::ExactSoname(rest.to_string());
    }
    if let Some(rest) = token.strip_prefix("soname-match:") {
        return Pattern::SonameMatch(rest.to_string());
    }
    if let Some(rest) = token.strip_prefix("path-match:") {
        return Pattern::PathMatch(rest.to_string());
    }
    if let Some(rest) = token.strip_prefix("path:") {
        return Pattern::Path(PathBuf::from(rest));
    }
    if token == "gl:" {
        return Pattern::Gl;
    }
    if token == "nvidia:" {
        return Pattern::Nvidia;
    }
    Pattern::Bare(token.to_string())
}

type ModifierCtor = fn(Box<Pattern>) -> Pattern;

const MODIFIER_PREFIXES: &[(&str, ModifierCtor)] = &[
    ("if-exists:", Pattern::IfExists as ModifierCtor),
    ("if-same-abi:", Pattern::IfSameAbi as ModifierCtor),
    ("even-if-older:", Pattern::EvenIfOlder as ModifierCtor),
    ("only-dependencies:", Pattern::OnlyDependencies as ModifierCtor),
    ("no-dependencies:", Pattern::NoDependencies as ModifierCtor),
];

/// Parse a whole pattern-token sequence, expanding `from:FILE` tokens
/// inline by reading newline-separated tokens from the named file.
pub fn parse_patterns(tokens: &[String]) -> Result<Vec<Pattern>> {
    let mut out = Vec::new();
    for token in tokens {
        if let Some(path) = token.strip_prefix("from:") {
            let text = std::fs::read_to_string(path)?;
            for line in text.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    out.push(parse_token(line));
                }
            }
        } else {
            out.push(parse_token(token));
        }
    }
    Ok(out)
}

/// Strip `IfExists`/`IfSameAbi`/`EvenIfOlder`/`OnlyDependencies`/
/// `NoDependencies` wrappers, returning the modifier flags observed plus
/// the innermost pattern.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternModifiers {
    pub if_exists: bool,
    pub if_same_abi: bool,
    pub even_if_older: bool,
    pub only_dependencies: bool,
    pub no_dependencies: bool,
}

pub fn unwrap_modifiers(pattern: &Pattern) -> (PatternModifiers, &Pattern) {
    let mut modifiers = PatternModifiers::default();
    let mut current = pattern;
    loop {
        current = match current {
            Pattern::IfExists(inner) => {
                modifiers.if_exists = true;
                inner
            }
            Pattern::IfSameAbi(inner) => {
                modifiers.if_same_abi = true;
                inner
            }
            Pattern::EvenIfOlder(inner) => {
                modifiers.even_if_older = true;
                inner
            }
            Pattern::OnlyDependencies(inner) => {
                modifiers.only_dependencies = true;
                inner
            }
            Pattern::NoDependencies(inner) => {
                modifiers.no_dependencies = true;
                inner
            }
            other => return (modifiers, other),
        };
    }
}

/// One entry of the symlink farm to build: `link_name` (a resolved soname,
/// placed directly in `--dest`) pointing at `target` (a path inside, or
/// remapped from, the provider tree).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkPlanEntry {
    pub link_name: String,
    pub target: PathBuf,
}

/// A `--remap-link-prefix=FROM=TO` rule: a symlink target that would start
/// with `from` is rewritten to start with `to` instead, e.g. to make a
/// container-relative path resolve correctly from the host.
#[derive(Debug, Clone)]
pub struct RemapRule {
    pub from: PathBuf,
    pub to: PathBuf,
}

pub fn apply_remap(target: &Path, rules: &[RemapRule]) -> PathBuf {
    for rule in rules {
        if let Ok(suffix) = target.strip_prefix(&rule.from) {
            return rule.to.join(suffix);
        }
    }
    target.to_path_buf()
}

/// Confirm `candidate` resolves to a path inside `provider_root`. A
/// pattern whose resolution steps (via `..` or a symlink) outside the
/// provider root is a fatal `PathEscape` for that one pattern, not the
/// whole run.
pub fn ensure_within_provider(candidate: &Path, provider_root: &Path) -> Result<()> {
    let canon_root = provider_root
        .canonicalize()
        .unwrap_or_else(|_| provider_root.to_path_buf());
    let canon_candidate = candidate
        .canonicalize()
        .unwrap_or_else(|_| candidate.to_path_buf());
    if canon_candidate.starts_with(&canon_root) {
        Ok(())
    } else {
        Err(path_escape_error(format!(
            "{} resolves outside provider root {}",
            candidate.display(),
            provider_root.display()
        )))
    }
}

/// Decide whether a resolved `(container_path, provider_path)` pair should
/// produce a symlink: yes if the container copy is missing (`if_exists`
/// wasn't violated) or if `even_if_older` is set, else only when the
/// comparator chain says the provider is newer or the two are tied.
pub fn should_link(
    modifiers: PatternModifiers,
    container_facts: Option<&LibraryFacts>,
    provider_facts: &LibraryFacts,
    chain: &[Comparator],
) -> bool {
    let Some(container) = container_facts else {
        return true; // nothing in the container: always take the provider's copy
    };
    if modifiers.even_if_older {
        return true;
    }
    !matches!(
        run_chain(chain, container, provider_facts, Comparator::Provider),
        Verdict::ContainerNewer
    )
}

/// Compile one pattern into zero-or-one symlink plan entries. `resolve`
/// looks a soname or path up against the provider tree (supplied by the
/// caller, since that requires filesystem/cache access this module has no
/// opinion about); `knowledge` supplies per-soname comparator overrides.
pub fn compile_pattern(
    pattern: &Pattern,
    provider_root: &Path,
    resolve: impl Fn(&str) -> Option<(String, LibraryFacts, Option<LibraryFacts>)>,
    knowledge: Option<&LibraryKnowledge>,
) -> Result<Option<SymlinkPlanEntry>> {
    let (modifiers, inner) = unwrap_modifiers(pattern);
    let soname_hint = match inner {
        Pattern::Soname(s) | Pattern::ExactSoname(s) | Pattern::Bare(s) => s.clone(),
        Pattern::Path(p) => p.to_string_lossy().into_owned(),
        Pattern::SonameMatch(_) | Pattern::PathMatch(_) | Pattern::Gl | Pattern::Nvidia => {
            return Ok(None); // glob-expanding variants are resolved by the caller's directory walk
        }
        _ => unreachable!("unwrap_modifiers strips every modifier variant"),
    };

    let Some((soname, provider_facts, container_facts)) = resolve(&soname_hint) else {
        if modifiers.if_exists {
            return Ok(None);
        }
        return Err(crate::error::not_found_error(format!(
            "pattern target {soname_hint} not found"
        )));
    };

    ensure_within_provider(Path::new(&provider_facts.path), provider_root)?;

    let chain = knowledge
        .and_then(|k| k.lookup(&soname))
        .and_then(|o| o.chain.clone())
        .unwrap_or_else(crate::comparator::default_chain);

    if !should_link(modifiers, container_facts.as_ref(), &provider_facts, &chain) {
        return Ok(None);
    }

    Ok(Some(SymlinkPlanEntry {
        link_name: soname,
        target: PathBuf::from(provider_facts.path),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LibraryFacts;
    use std::collections::BTreeSet;

    #[test]
    fn parses_bare_word_as_positional() {
        assert_eq!(parse_token("libGL.so.1"), Pattern::Bare("libGL.so.1".to_string()));
    }

    #[test]
    fn parses_soname_token() {
        assert_eq!(parse_token("soname:libGL.so.1"), Pattern::Soname("libGL.so.1".to_string()));
    }

    #[test]
    fn parses_nested_modifiers() {
        let parsed = parse_token("even-if-older:if-exists:soname:libGL.so.1");
        assert_eq!(
            parsed,
            Pattern::EvenIfOlder(Box::new(Pattern::IfExists(Box::new(Pattern::Soname(
                "libGL.so.1".to_string()
            )))))
        );
    }

    #[test]
    fn unwrap_modifiers_collects_every_flag() {
        let parsed = parse_token("even-if-older:if-exists:soname:libGL.so.1");
        let (modifiers, inner) = unwrap_modifiers(&parsed);
        assert!(modifiers.even_if_older);
        assert!(modifiers.if_exists);
        assert_eq!(inner, &Pattern::Soname("libGL.so.1".to_string()));
    }

    #[test]
    fn remap_rule_rewrites_matching_prefix() {
        let rules = vec![RemapRule {
            from: PathBuf::from("/host/usr/lib"),
            to: PathBuf::from("/run/host/usr/lib"),
        }];
        let remapped = apply_remap(Path::new("/host/usr/lib/libGL.so.1"), &rules);
        assert_eq!(remapped, PathBuf::from("/run/host/usr/lib/libGL.so.1"));
    }

    #[test]
    fn scenario_even_if_older_forces_a_link_despite_container_being_newer() {
        let container = LibraryFacts {
            path: "/container/libGL.so.1".to_string(),
            soname: "libGL.so.1".to_string(),
            versions: BTreeSet::new(),
            symbols: BTreeSet::new(),
        };
        let provider = LibraryFacts {
            path: "/provider/libGL.so.1".to_string(),
            soname: "libGL.so.1".to_string(),
            versions: BTreeSet::new(),
            symbols: BTreeSet::new(),
        };
        let modifiers = PatternModifiers {
            even_if_older: true,
            ..Default::default()
        };
        assert!(should_link(modifiers, Some(&container), &provider, &[Comparator::Container]));
    }

    #[test]
    fn should_link_defers_to_chain_without_even_if_older() {
        let container = LibraryFacts {
            path: "/container/libGL.so.1".to_string(),
            soname: "libGL.so.1".to_string(),
            versions: BTreeSet::new(),
            symbols: BTreeSet::new(),
        };
        let provider = LibraryFacts {
            path: "/provider/libGL.so.1".to_string(),
            soname: "libGL.so.1".to_string(),
            versions: BTreeSet::new(),
            symbols: BTreeSet::new(),
        };
        assert!(!should_link(
            PatternModifiers::default(),
            Some(&container),
            &provider,
            &[Comparator::Container]
        ));
    }

    #[test]
    fn missing_container_always_links() {
        let provider = LibraryFacts {
            path: "/provider/libGL.so.1".to_string(),
            soname: "libGL.so.1".to_string(),
            versions: BTreeSet::new(),
            symbols: BTreeSet::new(),
        };
        assert!(should_link(PatternModifiers::default(), None, &provider, &[Comparator::Container]));
    }
}
