//! Pattern-based rule matching for per-route rate limiting.
//!
//! Rules carry a path pattern with three token kinds:
//!
//! - literal segments (`/api/health`)
//! - named parameters (`/users/:id`, one non-`/` segment)
//! - a terminal wildcard (`/api/*`, matching the remainder)
//!
//! Each rule compiles once into an anchored regular expression. The matcher
//! keeps rules in priority-descending order, stable by insertion on ties, so
//! the highest-priority matching rule wins.

use crate::error::{GatewayError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How to extract the rate limit identity from a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifyBy {
    /// Identify clients by IP address
    #[default]
    Ip,
    /// Identify clients by a request header value
    Header,
}

/// A rate limiting rule applied to matched requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Human-readable identifier for the rule
    pub name: String,
    /// Path pattern to match against
    pub pattern: String,
    /// HTTP methods this rule applies to (empty means all methods)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Match order; higher values are checked first
    #[serde(default)]
    pub priority: i32,
    /// Maximum number of requests allowed per window
    pub limit: i64,
    /// Sliding window duration in seconds
    pub window_secs: u64,
    /// How to extract the client identifier
    #[serde(default)]
    pub identify_by: IdentifyBy,
    /// Header to use when `identify_by` is `header`
    #[serde(default)]
    pub header_name: String,
}

impl Rule {
    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// A matched rule along with extracted path parameters
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// The matched rule, shared with the compiled set
    pub rule: Arc<Rule>,
    /// Named path parameters captured from the request path.
    /// A terminal wildcard capture is bound to the reserved name `*`.
    pub params: HashMap<String, String>,
}

#[derive(Debug)]
struct CompiledRule {
    rule: Arc<Rule>,
    regex: Regex,
    param_names: Vec<String>,
    /// Uppercased at compile time; None means all methods are allowed
    methods: Option<Vec<String>>,
}

/// Evaluates request paths and methods against a compiled rule set
#[derive(Debug)]
pub struct Matcher {
    compiled: Vec<CompiledRule>,
}

impl Matcher {
    /// Compile the provided rules into a matcher.
    ///
    /// Rules are sorted by priority descending; insertion order is preserved
    /// on ties. Fails on the first invalid rule, naming it.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push(compile(rule)?);
        }

        // Vec::sort_by is stable, which keeps the tie-break on insertion order.
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

        Ok(Self { compiled })
    }

    /// Return the highest-priority rule matching the given method and path,
    /// or None if no rule matches.
    ///
    /// This sits on the request hot path: allocation is limited to the
    /// params map, and the returned rule is shared with the compiled set.
    pub fn match_request(&self, method: &str, path: &str) -> Option<RuleMatch> {
        for cr in &self.compiled {
            if let Some(methods) = &cr.methods {
                if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
                    continue;
                }
            }

            let captures = match cr.regex.captures(path) {
                Some(c) => c,
                None => continue,
            };

            let mut params = HashMap::with_capacity(cr.param_names.len());
            for (i, name) in cr.param_names.iter().enumerate() {
                if let Some(value) = captures.get(i + 1) {
                    params.insert(name.clone(), value.as_str().to_string());
                }
            }

            return Some(RuleMatch {
                rule: Arc::clone(&cr.rule),
                params,
            });
        }

        None
    }

    /// Number of compiled rules
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// Whether the matcher holds no rules
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

fn compile(rule: Rule) -> Result<CompiledRule> {
    let invalid = |reason: &str| GatewayError::InvalidRule {
        name: rule.name.clone(),
        reason: reason.to_string(),
    };

    if rule.limit <= 0 {
        return Err(invalid("limit must be greater than 0"));
    }
    if rule.window_secs == 0 {
        return Err(invalid("window must be greater than 0"));
    }
    if rule.identify_by == IdentifyBy::Header && rule.header_name.trim().is_empty() {
        return Err(invalid("header_name is required when identify_by is header"));
    }

    let (pattern, param_names) = pattern_to_regex(&rule.pattern).map_err(|reason| {
        GatewayError::InvalidRule {
            name: rule.name.clone(),
            reason,
        }
    })?;

    let regex = Regex::new(&pattern)
        .map_err(|e| invalid(&format!("invalid pattern {:?}: {}", rule.pattern, e)))?;

    let methods = if rule.methods.is_empty() {
        None
    } else {
        Some(rule.methods.iter().map(|m| m.to_uppercase()).collect())
    };

    Ok(CompiledRule {
        rule: Arc::new(rule),
        regex,
        param_names,
        methods,
    })
}

/// Convert a path pattern to an anchored regex string and extract parameter
/// names.
///
/// - `/exact/path` -> `^/exact/path$`
/// - `/users/:id`  -> `^/users/([^/]+)$`
/// - `/api/*`      -> `^/api/(.*)`
fn pattern_to_regex(pattern: &str) -> std::result::Result<(String, Vec<String>), String> {
    if pattern.is_empty() {
        return Err("pattern is required".to_string());
    }
    if !pattern.starts_with('/') {
        return Err("pattern must start with /".to_string());
    }

    let mut result = String::from("^");
    let mut param_names = Vec::new();

    let segments: Vec<&str> = pattern.split('/').skip(1).collect();
    for (i, seg) in segments.iter().enumerate() {
        result.push('/');

        if *seg == "*" {
            if i != segments.len() - 1 {
                return Err("wildcard (*) must be the last segment".to_string());
            }
            result.push_str("(.*)");
            param_names.push("*".to_string());
        } else if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err("empty parameter name in pattern".to_string());
            }
            if !is_valid_identifier(name) {
                return Err(format!(
                    "invalid parameter name {:?}: must start with letter or underscore, followed by letters, digits, or underscores",
                    name
                ));
            }
            result.push_str("([^/]+)");
            param_names.push(name.to_string());
        } else {
            result.push_str(&regex::escape(seg));
        }
    }

    // The $ anchor is omitted only for terminal-wildcard patterns.
    if !pattern.ends_with('*') {
        result.push('$');
    }

    Ok((result, param_names))
}

fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
