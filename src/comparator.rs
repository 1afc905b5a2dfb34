//! Library comparator chain: decides which of two candidate copies of a
//! library is "newer", for the capture tool's symlink-farm decisions.
//!
//! The by-name comparator follows glibc's `strverscmp` semantics; the
//! "compare as sets, strict superset wins" shape is shared by
//! `by-versions`/`by-symbols`, backed by `BTreeSet`-based set bookkeeping.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

/// Result of one comparator: which side (if either) is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    ContainerNewer,
    Equal,
    ProviderNewer,
}

impl Verdict {
    fn from_signum(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Greater => Verdict::ContainerNewer,
            Ordering::Less => Verdict::ProviderNewer,
            Ordering::Equal => Verdict::Equal,
        }
    }

    fn is_decisive(self) -> bool {
        !matches!(self, Verdict::Equal)
    }
}

/// The named comparators available in a chain. `Container`/`Provider` are
/// unconditional constant preferences used to terminate a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Name,
    Versions,
    Symbols,
    Container,
    Provider,
}

/// What a comparator needs to know about one side of the comparison: its
/// path, the `DT_VERDEF` strings it defines (minus `VER_FLG_BASE`), and its
/// defined, non-linker-generated symbol names (optionally paired with a
/// version suffix).
#[derive(Debug, Clone, Default)]
pub struct LibraryFacts {
    pub path: String,
    pub soname: String,
    pub versions: BTreeSet<String>,
    pub symbols: BTreeSet<String>,
}

/// Names the linker itself defines that must never count as "library
/// surface" for the by-symbols comparator.
const LINKER_GENERATED: &[&str] = &[
    "_init",
    "_fini",
    "__bss_start",
    "_edata",
    "_end",
    "_GLOBAL_OFFSET_TABLE_",
    "_DYNAMIC",
    "__dso_handle",
];

pub fn is_linker_generated(symbol: &str) -> bool {
    symbol.is_empty() || LINKER_GENERATED.contains(&symbol)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `by-name`: version-aware comparison of the two realpath-resolved
/// basenames. Returns `Equal` ("non-comparable") if the names are equal,
/// or if either basename is exactly the bare, unversioned soname.
pub fn compare_by_name(container: &LibraryFacts, provider: &LibraryFacts) -> Verdict {
    let c_base = basename(&container.path);
    let p_base = basename(&provider.path);
    if c_base == p_base {
        return Verdict::Equal;
    }
    if c_base == container.soname || p_base == provider.soname {
        return Verdict::Equal;
    }
    Verdict::from_signum(strverscmp(c_base, p_base))
}

/// `by-versions`: strict-superset comparison of `DT_VERDEF` sets.
pub fn compare_by_versions(container: &LibraryFacts, provider: &LibraryFacts) -> Verdict {
    compare_sets(&container.versions, &provider.versions)
}

/// `by-symbols`: strict-superset comparison of defined-symbol sets, after
/// filtering linker-generated and empty names (callers are expected to have
/// already applied any `library-knowledge` public-symbol glob filter).
pub fn compare_by_symbols(container: &LibraryFacts, provider: &LibraryFacts) -> Verdict {
    compare_sets(&container.symbols, &provider.symbols)
}

fn compare_sets(container: &BTreeSet<String>, provider: &BTreeSet<String>) -> Verdict {
    if container == provider {
        return Verdict::Equal;
    }
    let container_superset = provider.is_subset(container);
    let provider_superset = container.is_subset(provider);
    match (container_superset, provider_superset) {
        (true, false) => Verdict::ContainerNewer,
        (false, true) => Verdict::ProviderNewer,
        _ => Verdict::Equal, // incomparable
    }
}

/// Run a chain of comparators in order; the first decisive (non-`Equal`)
/// verdict wins. An empty chain, or one that bottoms out at `Equal`,
/// resolves via `tie_break`.
pub fn run_chain(
    chain: &[Comparator],
    container: &LibraryFacts,
    provider: &LibraryFacts,
    tie_break: Comparator,
) -> Verdict {
    for comparator in chain {
        let verdict = match comparator {
            Comparator::Name => compare_by_name(container, provider),
            Comparator::Versions => compare_by_versions(container, provider),
            Comparator::Symbols => compare_by_symbols(container, provider),
            Comparator::Container => Verdict::ContainerNewer,
            Comparator::Provider => Verdict::ProviderNewer,
        };
        if verdict.is_decisive() {
            return verdict;
        }
    }
    match tie_break {
        Comparator::Container => Verdict::ContainerNewer,
        _ => Verdict::ProviderNewer,
    }
}

/// The default chain when no `--compare-by` or library-knowledge override
/// applies.
pub fn default_chain() -> Vec<Comparator> {
    vec![Comparator::Name, Comparator::Provider]
}

/// A `strverscmp`-style comparison: runs of digits compare numerically
/// (so `"1.9"` < `"1.10"`), everything else compares byte-for-byte. This is
/// the glibc behavior the by-name comparator relies on to order versioned
/// sonames correctly.
pub fn strverscmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (ca, cb) = (a[i], b[j]);
        if ca.is_ascii_digit() && cb.is_ascii_digit() {
            let start_a = i;
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            let start_b = j;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            let na = trim_leading_zeros(&a[start_a..i]);
            let nb = trim_leading_zeros(&b[start_b..j]);
            let ordering = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
            if ordering != Ordering::Equal {
                return ordering;
            }
        } else if ca != cb {
            return ca.cmp(&cb);
        } else {
            i += 1;
            j += 1;
        }
    }
    (a.len() - i).cmp(&(b.len() - j))
}

fn trim_leading_zeros(digits: &[u8]) -> &[u8] {
    let pos = digits.iter().position(|&b| b != b'0').unwrap_or(digits.len() - 1);
    &digits[pos..]
}

/// Per-soname overrides loaded from a `.desktop`-style key-value file: a
/// replacement comparator chain and glob patterns that narrow the
/// symbol/version sets `by-symbols`/`by-versions` consider "public".
#[derive(Debug, Clone, Default)]
pub struct LibraryOverride {
    pub chain: Option<Vec<Comparator>>,
    pub public_symbols: Vec<String>,
    pub public_symbol_versions: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LibraryKnowledge {
    overrides: HashMap<String, LibraryOverride>,
}

impl LibraryKnowledge {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parse a `.desktop`-style file: `[SonameName]` group headers, then
    /// `key=value` lines until the next group. Recognized keys:
    /// `compare-by` (comma-separated comparator names), `public-symbols`,
    /// `public-symbol-versions` (semicolon-separated glob lists).
    pub fn parse(text: &str) -> Self {
        let mut overrides = HashMap::new();
        let mut current: Option<(String, LibraryOverride)> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                if let Some((soname, entry)) = current.take() {
                    overrides.insert(soname, entry);
                }
                current = Some((name.to_string(), LibraryOverride::default()));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let Some((_, entry)) = current.as_mut() else {
                continue;
            };
            match key.trim() {
                "compare-by" => {
                    entry.chain = Some(
                        value
                            .split(',')
                            .filter_map(parse_comparator_name)
                            .collect(),
                    );
                }
                "public-symbols" => {
                    entry.public_symbols = value.split(';').map(str::to_string).collect();
                }
                "public-symbol-versions" => {
                    entry.public_symbol_versions = value.split(';').map(str::to_string).collect();
                }
                _ => {}
            }
        }
        if let Some((soname, entry)) = current.take() {
            overrides.insert(soname, entry);
        }
        LibraryKnowledge { overrides }
    }

    pub fn lookup(&self, soname: &str) -> Option<&LibraryOverride> {
        self.overrides.get(soname)
    }
}

fn parse_comparator_name(name: &str) -> Option<Comparator> {
    match name.trim() {
        "name" => Some(Comparator::Name),
        "versions" => Some(Comparator::Versions),
        "symbols" => Some(Comparator::Symbols),
        "container" => Some(Comparator::Container),
        "provider" => Some(Comparator::Provider),
        _ => None,
    }
}

/// Filter a symbol/version set down to the entries matching at least one
/// glob pattern in `patterns` (a `*`-only glob: `*` matches any substring,
/// everything else is literal). An empty pattern list means "no filter".
pub fn filter_by_globs<'a>(values: &'a BTreeSet<String>, patterns: &[String]) -> BTreeSet<String> {
    if patterns.is_empty() {
        return values.clone();
    }
    values
        .iter()
        .filter(|v| patterns.iter().any(|p| glob_match(p, v)))
        .cloned()
        .collect()
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(path: &str, soname: &str) -> LibraryFacts {
        LibraryFacts {
            path: path.to_string(),
            soname: soname.to_string(),
            versions: BTreeSet::new(),
            symbols: BTreeSet::new(),
        }
    }

    #[test]
    fn strverscmp_orders_minor_versions_numerically() {
        assert_eq!(strverscmp("libfoo.so.1.9", "libfoo.so.1.10"), Ordering::Less);
    }

    #[test]
    fn strverscmp_equal_strings_are_equal() {
        assert_eq!(strverscmp("libfoo.so.1", "libfoo.so.1"), Ordering::Equal);
    }

    #[test]
    fn by_name_is_noncomparable_for_bare_soname() {
        let container = facts("/a/libfoo.so.1", "libfoo.so.1");
        let provider = facts("/b/libfoo.so.1.2", "libfoo.so.1");
        assert_eq!(compare_by_name(&container, &provider), Verdict::Equal);
    }

    #[test]
    fn scenario_versions_then_name_prefers_the_superset() {
        let mut container = facts("/c/libfoo.so.1.2", "libfoo.so.1");
        container.versions = ["FOO_1.0", "FOO_1.1"].iter().map(|s| s.to_string()).collect();
        let mut provider = facts("/p/libfoo.so.1.1", "libfoo.so.1");
        provider.versions = ["FOO_1.0", "FOO_1.1", "FOO_1.2"].iter().map(|s| s.to_string()).collect();

        let chain = [Comparator::Versions, Comparator::Name];
        let verdict = run_chain(&chain, &container, &provider, Comparator::Provider);
        assert_eq!(verdict, Verdict::ProviderNewer);
    }

    #[test]
    fn empty_chain_falls_back_to_provider() {
        let container = facts("/a/libfoo.so.1", "libfoo.so.1");
        let provider = facts("/b/libfoo.so.1", "libfoo.so.1");
        let verdict = run_chain(&[], &container, &provider, Comparator::Provider);
        assert_eq!(verdict, Verdict::ProviderNewer);
    }

    #[test]
    fn library_knowledge_parses_desktop_style_file() {
        let text = "[libGL.so.1]\ncompare-by=versions,name\npublic-symbols=gl*;glX*\n";
        let knowledge = LibraryKnowledge::parse(text);
        let entry = knowledge.lookup("libGL.so.1").unwrap();
        assert_eq!(entry.chain.as_ref().unwrap(), &[Comparator::Versions, Comparator::Name]);
        assert_eq!(entry.public_symbols, vec!["gl*", "glX*"]);
    }

    #[test]
    fn glob_match_supports_prefix_and_suffix_wildcards() {
        assert!(glob_match("gl*", "glXSwapBuffers"));
        assert!(glob_match("*Buffers", "glXSwapBuffers"));
        assert!(!glob_match("gl*", "vkCreateInstance"));
    }

    #[test]
    fn is_linker_generated_filters_known_names() {
        assert!(is_linker_generated("_GLOBAL_OFFSET_TABLE_"));
        assert!(is_linker_generated(""));
        assert!(!is_linker_generated("glXSwapBuffers"));
    }
}
