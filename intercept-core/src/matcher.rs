//! Rule condition matching
//!
//! Everything here is pure: a compiled pattern and a traffic unit in, a bool
//! out. Patterns are compiled once when a snapshot is built, so the per-unit
//! cost is a handful of regex/wildcard checks.

use crate::rules::{BreakpointRule, ChaosRule, MockRule, MockTarget, Rule};
use hub_common::{RuleMeta, TrafficUnit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

/// Prefix that switches a plain `url_pattern` column into regex mode
pub const REGEX_PREFIX: &str = "regex:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Glob,
    Regex,
}

/// Which part of the URL a glob is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobTarget {
    /// Pattern matches anything
    Any,
    /// `scheme://host/path`, query and fragment stripped
    FullUrl,
    /// `/path`
    Path,
    /// `host/path`
    HostPath,
}

/// Compiled URL pattern
///
/// Glob syntax: `*` matches within one path segment, `**` matches across
/// segments and a trailing `/**` also matches the bare prefix. Regex mode is
/// an unanchored search over the full URL, query included.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    mode: MatchMode,
    target: GlobTarget,
    regex: Option<Regex>,
}

impl UrlPattern {
    pub fn compile(pattern: &str, mode: MatchMode) -> Result<Self, regex::Error> {
        match mode {
            MatchMode::Glob => Self::glob(pattern),
            MatchMode::Regex => Self::regex(pattern),
        }
    }

    /// Parse a pattern column: `regex:` prefix selects regex mode
    pub fn parse(pattern: &str) -> Result<Self, regex::Error> {
        match pattern.strip_prefix(REGEX_PREFIX) {
            Some(re) => Self::regex(re),
            None => Self::glob(pattern),
        }
    }

    pub fn glob(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = pattern.trim();
        let target = if pattern.is_empty() || pattern == "*" || pattern == "**" {
            GlobTarget::Any
        } else if pattern.contains("://") {
            GlobTarget::FullUrl
        } else if pattern.starts_with('/') {
            GlobTarget::Path
        } else {
            GlobTarget::HostPath
        };

        let regex = match target {
            GlobTarget::Any => None,
            _ => Some(Regex::new(&glob_to_regex(pattern))?),
        };

        Ok(Self {
            source: pattern.to_string(),
            mode: MatchMode::Glob,
            target,
            regex,
        })
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: pattern.to_string(),
            mode: MatchMode::Regex,
            target: GlobTarget::FullUrl,
            regex: Some(Regex::new(pattern)?),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn matches(&self, url: &str) -> bool {
        let regex = match &self.regex {
            Some(regex) => regex,
            None => return true,
        };

        if self.mode == MatchMode::Regex {
            return regex.is_match(url);
        }

        let subject = match self.target {
            GlobTarget::Any => return true,
            GlobTarget::FullUrl => strip_query(url).to_string(),
            GlobTarget::Path => url_path(url),
            GlobTarget::HostPath => match url::Url::parse(url) {
                Ok(parsed) => format!("{}{}", parsed.host_str().unwrap_or(""), parsed.path()),
                Err(_) => strip_query(url).to_string(),
            },
        };
        regex.is_match(&subject)
    }
}

fn strip_query(url: &str) -> &str {
    url.split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default()
}

fn url_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => strip_query(url).to_string(),
    }
}

/// Translate a glob into an anchored regex
fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '/' if i + 3 == chars.len() && chars[i + 1] == '*' && chars[i + 2] == '*' => {
                out.push_str("(?:/.*)?");
                i += 3;
                continue;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push_str(".*");
                i += 2;
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
        i += 1;
    }

    out.push('$');
    out
}

/// HTTP method matcher: case-insensitive, `*` and `?` wildcards
#[derive(Debug, Clone)]
pub struct MethodPattern {
    source: String,
    wild: WildMatch,
}

impl MethodPattern {
    pub fn new(pattern: &str) -> Self {
        let source = pattern.trim().to_ascii_uppercase();
        Self {
            wild: WildMatch::new(&source),
            source,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, method: &str) -> bool {
        self.wild.matches(&method.to_ascii_uppercase())
    }
}

/// Treat empty columns as "no constraint"
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// A rule that can be checked against a traffic unit
pub trait Matchable {
    fn meta(&self) -> &RuleMeta;

    /// Type-specific condition only; enabled flag and device scope are
    /// checked by [`matches`].
    fn condition_matches(&self, unit: &TrafficUnit) -> bool;
}

/// Full match check for one rule against one unit
pub fn matches<R: Matchable + ?Sized>(rule: &R, unit: &TrafficUnit) -> bool {
    let meta = rule.meta();
    meta.enabled && meta.applies_to_device(unit.device_id()) && rule.condition_matches(unit)
}

fn url_and_method_match(
    url: Option<&UrlPattern>,
    method: Option<&MethodPattern>,
    unit: &TrafficUnit,
) -> bool {
    if let Some(pattern) = url {
        if !pattern.matches(unit.url()) {
            return false;
        }
    }
    match (method, unit.method()) {
        (None, _) => true,
        (Some(pattern), Some(method)) => pattern.matches(method),
        // A method constraint never matches frames
        (Some(_), None) => false,
    }
}

impl Matchable for MockRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn condition_matches(&self, unit: &TrafficUnit) -> bool {
        let condition = &self.condition;
        match (self.target, unit) {
            (MockTarget::Http, TrafficUnit::Http(exchange)) => {
                exchange.response.is_none()
                    && condition.url.matches(&exchange.url)
                    && condition
                        .method
                        .as_ref()
                        .map_or(true, |m| m.matches(&exchange.method))
            }
            (MockTarget::WebSocket, TrafficUnit::Frame(frame)) => {
                condition.url.matches(&frame.session_url)
                    && condition
                        .session
                        .as_ref()
                        .map_or(true, |s| s.matches(&frame.session_id))
                    && condition.direction.map_or(true, |d| d == frame.direction)
            }
            _ => false,
        }
    }
}

impl Matchable for BreakpointRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn condition_matches(&self, unit: &TrafficUnit) -> bool {
        self.phase == unit.phase()
            && url_and_method_match(self.url.as_ref(), self.method.as_ref(), unit)
    }
}

impl Matchable for ChaosRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn condition_matches(&self, unit: &TrafficUnit) -> bool {
        self.fault.acts_on(unit.phase())
            && url_and_method_match(self.url.as_ref(), self.method.as_ref(), unit)
    }
}

impl Matchable for Rule {
    fn meta(&self) -> &RuleMeta {
        match self {
            Rule::Mock(r) => &r.meta,
            Rule::Breakpoint(r) => &r.meta,
            Rule::Chaos(r) => &r.meta,
        }
    }

    fn condition_matches(&self, unit: &TrafficUnit) -> bool {
        match self {
            Rule::Mock(r) => r.condition_matches(unit),
            Rule::Breakpoint(r) => r.condition_matches(unit),
            Rule::Chaos(r) => r.condition_matches(unit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::{Direction, HttpExchange, HttpResponse, Opcode, WsFrame};

    #[test]
    fn test_glob_path_patterns() {
        let single = UrlPattern::glob("/api/*").unwrap();
        assert!(single.matches("https://example.com/api/login"));
        assert!(single.matches("/api/login?user=1"));
        assert!(!single.matches("https://example.com/api/v1/login"));
        assert!(!single.matches("https://example.com/other/api/login"));

        let deep = UrlPattern::glob("/api/**").unwrap();
        assert!(deep.matches("https://example.com/api/v1/users/7"));
        assert!(deep.matches("https://example.com/api"));
        assert!(!deep.matches("https://example.com/apix"));

        let exact = UrlPattern::glob("/api/login").unwrap();
        assert!(exact.matches("https://example.com/api/login?x=1"));
        assert!(!exact.matches("https://example.com/api/logins"));
    }

    #[test]
    fn test_glob_host_and_full_url_patterns() {
        let host = UrlPattern::glob("*.example.com/**").unwrap();
        assert!(host.matches("https://api.example.com/v1/items"));
        assert!(!host.matches("https://example.org/v1/items"));

        let full = UrlPattern::glob("https://api.example.com/v?/items").unwrap();
        assert!(full.matches("https://api.example.com/v1/items?page=2"));
        assert!(!full.matches("http://api.example.com/v1/items"));

        let dots = UrlPattern::glob("/file.json").unwrap();
        assert!(!dots.matches("/fileXjson"));
    }

    #[test]
    fn test_match_all_patterns() {
        for pattern in ["*", "**", ""] {
            let p = UrlPattern::glob(pattern).unwrap();
            assert!(p.matches("https://anything.example/at/all?x=1"));
        }
    }

    #[test]
    fn test_regex_mode() {
        let p = UrlPattern::parse("regex:/users/\\d+\\?").unwrap();
        assert_eq!(p.mode(), MatchMode::Regex);
        assert!(p.matches("https://example.com/users/42?full=1"));
        assert!(!p.matches("https://example.com/users/me?full=1"));

        assert!(UrlPattern::parse("regex:(unclosed").is_err());
    }

    #[test]
    fn test_method_pattern() {
        assert!(MethodPattern::new("get").matches("GET"));
        assert!(MethodPattern::new("*").matches("DELETE"));
        assert!(MethodPattern::new("P*").matches("patch"));
        assert!(!MethodPattern::new("POST").matches("PUT"));
    }

    #[test]
    fn test_url_and_method_on_frames() {
        let frame = TrafficUnit::Frame(WsFrame::new(
            "D1",
            "s-1",
            "wss://chat.example.com/socket",
            Direction::Inbound,
            Opcode::Text,
            "hi",
        ));
        let url = UrlPattern::glob("/socket").unwrap();
        assert!(url_and_method_match(Some(&url), None, &frame));
        assert!(!url_and_method_match(Some(&url), Some(&MethodPattern::new("*")), &frame));

        let http = TrafficUnit::Http(
            HttpExchange::new("D1", "GET", "https://chat.example.com/socket")
                .with_response(HttpResponse::new(101)),
        );
        assert!(url_and_method_match(Some(&url), Some(&MethodPattern::new("get")), &http));
    }
}
