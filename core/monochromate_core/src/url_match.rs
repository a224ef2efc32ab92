//! Exclusion matching for page URLs: exact domains and `*` wildcard patterns.

use std::collections::BTreeSet;

use regex::Regex;
use serde::Serialize;
use tracing::warn;
use url::Url;

const DISPLAY_NAME_MAX: usize = 45;

fn parse_lenient(input: &str) -> Option<Url> {
    if input.starts_with("http") {
        Url::parse(input).ok()
    } else {
        Url::parse(&format!("https://{input}")).ok()
    }
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn strip_scheme_and_www(input: &str) -> &str {
    let rest = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))
        .unwrap_or(input);
    strip_www(rest)
}

/// Host (without a leading `www.`), path, query and fragment. The scheme is dropped.
pub fn normalize_url(url: &str) -> String {
    let Some(parsed) = parse_lenient(url) else {
        return strip_scheme_and_www(url).to_string();
    };
    let Some(host) = parsed.host_str() else {
        return strip_scheme_and_www(url).to_string();
    };

    let mut out = String::with_capacity(url.len());
    out.push_str(strip_www(host));
    out.push_str(parsed.path());
    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = parsed.fragment().filter(|f| !f.is_empty()) {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

pub fn get_domain(url: &str) -> String {
    if let Some(parsed) = parse_lenient(url) {
        if let Some(host) = parsed.host_str() {
            return strip_www(host).to_string();
        }
    }
    strip_scheme_and_www(url)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Anchored, case-insensitive regex where `*` matches anything and every other
/// character is literal.
pub fn pattern_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?i)^{body}$"))
}

enum CompiledPattern {
    Wildcard(Regex),
    Prefix(String),
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Option<Self> {
        let normalized = normalize_url(pattern);
        if !normalized.contains('*') {
            return Some(CompiledPattern::Prefix(normalized));
        }
        match pattern_to_regex(&normalized) {
            Ok(re) => Some(CompiledPattern::Wildcard(re)),
            Err(err) => {
                warn!("ignoring url pattern '{pattern}': {err}");
                None
            }
        }
    }

    fn matches(&self, normalized_url: &str) -> bool {
        match self {
            CompiledPattern::Wildcard(re) => re.is_match(normalized_url),
            CompiledPattern::Prefix(prefix) => normalized_url.starts_with(prefix.as_str()),
        }
    }
}

pub fn url_matches_pattern(url: &str, pattern: &str) -> bool {
    CompiledPattern::compile(pattern)
        .map(|p| p.matches(&normalize_url(url)))
        .unwrap_or(false)
}

pub fn should_exclude<I>(url: &str, domain_blacklist: &BTreeSet<String>, pattern_blacklist: I) -> bool
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    if domain_blacklist.contains(&get_domain(url)) {
        return true;
    }
    pattern_blacklist
        .into_iter()
        .any(|pattern| url_matches_pattern(url, pattern.as_ref()))
}

/// Exclusion lists compiled once and reused for every tab of a bulk pass.
pub struct ExclusionMatcher {
    domains: BTreeSet<String>,
    patterns: Vec<CompiledPattern>,
}

impl ExclusionMatcher {
    pub fn new(domains: &BTreeSet<String>, patterns: &BTreeSet<String>) -> Self {
        Self {
            domains: domains.clone(),
            patterns: patterns
                .iter()
                .filter_map(|p| CompiledPattern::compile(p))
                .collect(),
        }
    }

    pub fn is_excluded(&self, url: &str) -> bool {
        if self.domains.contains(&get_domain(url)) {
            return true;
        }
        if self.patterns.is_empty() {
            return false;
        }
        let normalized = normalize_url(url);
        self.patterns.iter().any(|p| p.matches(&normalized))
    }
}

/// A reasonable default pattern for excluding pages like `current_url`.
pub fn suggest_url_pattern(current_url: &str) -> String {
    let Ok(parsed) = Url::parse(current_url) else {
        return format!("{current_url}*");
    };
    let Some(host) = parsed.host_str() else {
        return format!("{current_url}*");
    };
    let domain = strip_www(host);
    let path = parsed.path();

    if path.contains("/status/") {
        return format!("{domain}/*/status/*");
    }
    if path.contains("/watch") {
        return format!("{domain}/watch*");
    }
    if path.contains("/maps/") {
        return format!("{domain}/maps/*");
    }
    if path.contains("/post/") || path.contains("/posts/") {
        return format!("{domain}/*/post/*");
    }
    if path.split('/').count() > 3 {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() >= 2 {
            return format!("{domain}/{}/*", parts[0]);
        }
    }
    format!("{domain}{path}*")
}

pub fn is_valid_url_pattern(pattern: &str) -> bool {
    let clean = pattern.replace('*', "placeholder");
    if !clean.contains('/') {
        return false;
    }
    if clean.starts_with("http") {
        Url::parse(&clean).is_ok()
    } else {
        Url::parse(&format!("https://{clean}")).is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionKind {
    Domain,
    Pattern,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exclusion {
    #[serde(rename = "type")]
    pub kind: ExclusionKind,
    pub value: String,
    pub display_name: String,
    pub favicon: String,
}

pub fn exclusion_display_name(value: &str, kind: ExclusionKind) -> String {
    if kind == ExclusionKind::Domain {
        return value.to_string();
    }

    let display = strip_scheme_and_www(value);
    if display.chars().count() <= DISPLAY_NAME_MAX {
        return display.to_string();
    }

    // Keep the domain intact and cut the path.
    let domain = get_domain(value);
    let path_part = display.replacen(domain.as_str(), "", 1);
    let domain_len = domain.chars().count();
    if path_part.chars().count() <= DISPLAY_NAME_MAX.saturating_sub(domain_len + 3) {
        return display.to_string();
    }
    let keep = DISPLAY_NAME_MAX.saturating_sub(domain_len + 6);
    let head: String = path_part.chars().take(keep).collect();
    format!("{domain}{head}...")
}

fn favicon_for(domain: &str) -> String {
    format!("https://www.google.com/s2/favicons?domain={domain}&sz=64")
}

/// Domains and patterns as one list, sorted by domain with domains first.
pub fn unified_exclusions(domains: &BTreeSet<String>, patterns: &BTreeSet<String>) -> Vec<Exclusion> {
    let mut out: Vec<Exclusion> = domains
        .iter()
        .map(|d| Exclusion {
            kind: ExclusionKind::Domain,
            value: d.clone(),
            display_name: d.clone(),
            favicon: favicon_for(d),
        })
        .chain(patterns.iter().map(|p| Exclusion {
            kind: ExclusionKind::Pattern,
            value: p.clone(),
            display_name: exclusion_display_name(p, ExclusionKind::Pattern),
            favicon: favicon_for(&get_domain(p)),
        }))
        .collect();

    out.sort_by(|a, b| {
        get_domain(&a.value)
            .cmp(&get_domain(&b.value))
            .then(a.kind.cmp(&b.kind))
            .then_with(|| a.value.cmp(&b.value))
    });
    out
}
