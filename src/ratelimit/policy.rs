//! Rate limit policies and endpoint matching.
//!
//! Three kinds of policy exist, from most to least specific:
//! - [`EndpointLimitPolicy`]: a path pattern plus an exact method or `*`
//! - [`UserLimitPolicy`]: an override for one user
//! - [`RoleLimitPolicy`]: the default for everyone holding a role
//!
//! Endpoint patterns are `/`-separated segments. A literal segment matches
//! itself, `:name` or `{name}` matches any single segment, and a trailing `*`
//! matches whatever remains.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Longest window accepted; anything above is clamped.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// A caller's role as supplied by authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Manager,
    User,
    /// Any role name not known to this crate, stored upper-cased.
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "ADMIN",
            Role::Manager => "MANAGER",
            Role::User => "USER",
            Role::Other(name) => name.as_str(),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        match name.as_str() {
            "" => Err("role name cannot be empty".to_string()),
            "ADMIN" => Ok(Role::Admin),
            "MANAGER" => Ok(Role::Manager),
            "USER" => Ok(Role::User),
            _ => Ok(Role::Other(name)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A request limit over a fixed time window.
///
/// Construction floors the limit to 1 and the window to one second, so a
/// malformed row can never produce a zero quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    limit: u64,
    window_secs: u64,
}

impl Quota {
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            limit: limit.max(1),
            window_secs: window_secs.clamp(1, MAX_WINDOW_SECS),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// The window as a chrono duration, for timestamp arithmetic.
    pub fn window_delta(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

fn default_enabled() -> bool {
    true
}

/// Default quota for every user holding `role`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLimitPolicy {
    pub role: Role,
    pub limit: u64,
    pub window_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RoleLimitPolicy {
    pub fn quota(&self) -> Quota {
        Quota::new(self.limit, self.window_secs)
    }
}

/// Per-user override that supersedes the role default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLimitPolicy {
    pub user_id: String,
    pub limit: u64,
    pub window_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl UserLimitPolicy {
    pub fn quota(&self) -> Quota {
        Quota::new(self.limit, self.window_secs)
    }
}

/// Quota for one endpoint, superseding user and role policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimitPolicy {
    pub endpoint: PathPattern,
    #[serde(default)]
    pub method: MethodMatch,
    pub limit: u64,
    pub window_secs: u64,
}

impl EndpointLimitPolicy {
    pub fn quota(&self) -> Quota {
        Quota::new(self.limit, self.window_secs)
    }

    /// Whether this policy applies to `path` and `method`.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        self.method.matches(method) && self.endpoint.matches(path)
    }

    fn rank(&self) -> (usize, bool, bool) {
        let (literals, exact_tail) = self.endpoint.specificity();
        (literals, exact_tail, self.method.is_exact())
    }
}

/// Pick the most specific endpoint policy for a request.
///
/// Ranking: more literal segments, then no trailing wildcard, then an exact
/// method over `*`. Ties go to the earliest policy.
pub fn best_endpoint_match<'a, I>(
    policies: I,
    path: &str,
    method: &str,
) -> Option<&'a EndpointLimitPolicy>
where
    I: IntoIterator<Item = &'a EndpointLimitPolicy>,
{
    let mut best: Option<&EndpointLimitPolicy> = None;

    for policy in policies {
        if !policy.matches(path, method) {
            continue;
        }
        match best {
            Some(current) if current.rank() >= policy.rank() => {}
            _ => best = Some(policy),
        }
    }

    best
}

/// HTTP method matcher: an exact method or any method.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MethodMatch {
    #[default]
    Any,
    Exact(String),
}

impl MethodMatch {
    pub fn matches(&self, method: &str) -> bool {
        match self {
            MethodMatch::Any => true,
            MethodMatch::Exact(expected) => expected.eq_ignore_ascii_case(method),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, MethodMatch::Exact(_))
    }
}

impl TryFrom<String> for MethodMatch {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value == "*" {
            return Ok(MethodMatch::Any);
        }
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid HTTP method '{}'", value));
        }
        Ok(MethodMatch::Exact(value.to_ascii_uppercase()))
    }
}

impl From<MethodMatch> for String {
    fn from(value: MethodMatch) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MethodMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodMatch::Any => f.write_str("*"),
            MethodMatch::Exact(method) => f.write_str(method),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
    Wildcard,
}

/// A parsed endpoint pattern such as `/api/boards/:id/tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if !raw.starts_with('/') {
            return Err(format!("endpoint pattern '{}' must start with '/'", raw));
        }

        let parts: Vec<&str> = split_path(raw).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = if *part == "*" {
                if i + 1 != parts.len() {
                    return Err(format!(
                        "endpoint pattern '{}': '*' is only allowed as the last segment",
                        raw
                    ));
                }
                Segment::Wildcard
            } else if part.starts_with(':') || (part.starts_with('{') && part.ends_with('}')) {
                Segment::Param
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `path` (query string excluded) matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_path(path);

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => return true,
                Segment::Param => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match parts.next() {
                    Some(part) if part == expected => {}
                    _ => return false,
                },
            }
        }

        parts.next().is_none()
    }

    /// `(literal segment count, has no trailing wildcard)`.
    fn specificity(&self) -> (usize, bool) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        let exact_tail = !matches!(self.segments.last(), Some(Segment::Wildcard));
        (literals, exact_tail)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Canonical spelling of a request path: non-empty segments joined by a
/// single `/`, with any query string dropped.
///
/// Counting scopes use this form so `/a/b/`, `/a//b` and `/a/b` share one
/// window, the same way [`PathPattern::matches`] treats them.
pub fn normalize_path(path: &str) -> String {
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in split_path(path) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

impl TryFrom<String> for PathPattern {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PathPattern::parse(&value)
    }
}

impl From<PathPattern> for String {
    fn from(value: PathPattern) -> Self {
        value.raw
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
