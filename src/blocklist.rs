use std::fs;
use std::path::Path;

use anyhow::Context;
use rustc_hash::FxHashSet;

use crate::proto_utils::canonical_name;

/// Read the blocked-domains file: UTF-8, one domain per line, blank lines
/// skipped, no comment syntax. Names come back canonical and sorted by
/// length, shortest first, so ancestors install before their subdomains.
pub fn load_blocked_domains(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read blocked domains file: {}", path.display()))?;
    let mut domains: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(canonical_name)
        .collect();
    domains.sort_by_key(String::len);
    Ok(domains)
}

/// True when `name` or any ancestor of it is present in `blocked`. Walks the
/// labels outward: `foo.bar.example.` then `bar.example.` then `example.`.
pub fn is_covered(name: &str, blocked: &FxHashSet<String>) -> bool {
    let mut rest = name;
    loop {
        if blocked.contains(rest) {
            return true;
        }
        match rest.split_once('.') {
            Some((_, tail)) if !tail.is_empty() => rest = tail,
            _ => return false,
        }
    }
}

/// Collapse a length-sorted domain list to the subtree roots: a domain whose
/// ancestor is already blocked adds nothing. Returns the domains to install
/// and the skipped count.
pub fn effective_blocked(domains: Vec<String>) -> (Vec<String>, usize) {
    let mut installed = Vec::new();
    let mut installed_set = FxHashSet::default();
    let mut skipped = 0;

    for domain in domains {
        if is_covered(&domain, &installed_set) {
            skipped += 1;
        } else {
            installed_set.insert(domain.clone());
            installed.push(domain);
        }
    }

    (installed, skipped)
}
