//! Request log and the counter queries the resolver runs against it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::Role;
use crate::error::Result;

/// One request as seen by the recorder middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub role: Option<Role>,
    pub path: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
}

impl RequestLogEntry {
    pub fn new(
        user_id: Option<String>,
        role: Option<Role>,
        path: impl Into<String>,
        method: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            role,
            path: path.into(),
            method: method.into().to_ascii_uppercase(),
            timestamp,
        }
    }

    /// Whether this entry falls in `scope`.
    pub fn in_scope(&self, scope: &CounterScope) -> bool {
        match scope {
            CounterScope::Endpoint {
                user_id,
                path,
                method,
            } => {
                self.user_id.as_deref() == Some(user_id.as_str())
                    && &self.path == path
                    && self.method.eq_ignore_ascii_case(method)
            }
            CounterScope::User { user_id } => self.user_id.as_deref() == Some(user_id.as_str()),
            CounterScope::Role { role } => self.role.as_ref() == Some(role),
        }
    }
}

/// Which log entries count against a quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterScope {
    /// Requests by one user to one exact path and method.
    Endpoint {
        user_id: String,
        path: String,
        method: String,
    },
    /// All requests by one user.
    User { user_id: String },
    /// All requests by users holding a role.
    Role { role: Role },
}

/// Result of a count query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCount {
    /// Entries inside the window.
    pub count: u64,
    /// Timestamp of the oldest entry inside the window.
    pub oldest: Option<DateTime<Utc>>,
}

/// Counts prior requests inside a window.
#[async_trait]
pub trait RequestCounter: Send + Sync {
    /// Count entries in `scope` with `since <= timestamp <= until`.
    async fn count(
        &self,
        scope: &CounterScope,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<WindowCount>;
}

/// Appends entries to the request log.
#[async_trait]
pub trait RequestLogWriter: Send + Sync {
    async fn append(&self, entry: RequestLogEntry) -> Result<()>;

    /// Drop entries older than `before`, returning how many were removed.
    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Request log held in process memory, ordered by insertion.
#[derive(Debug, Default)]
pub struct InMemoryRequestLog {
    entries: RwLock<Vec<RequestLogEntry>>,
}

impl InMemoryRequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entries(&self) -> Vec<RequestLogEntry> {
        self.entries.read().clone()
    }

    /// Synchronous append, handy when seeding.
    pub fn push(&self, entry: RequestLogEntry) {
        self.entries.write().push(entry);
    }
}

#[async_trait]
impl RequestCounter for InMemoryRequestLog {
    async fn count(
        &self,
        scope: &CounterScope,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<WindowCount> {
        let entries = self.entries.read();
        let mut result = WindowCount::default();

        for entry in entries
            .iter()
            .filter(|e| e.timestamp >= since && e.timestamp <= until)
            .filter(|e| e.in_scope(scope))
        {
            result.count += 1;
            result.oldest = Some(match result.oldest {
                Some(oldest) if oldest <= entry.timestamp => oldest,
                _ => entry.timestamp,
            });
        }

        Ok(result)
    }
}

#[async_trait]
impl RequestLogWriter for InMemoryRequestLog {
    async fn append(&self, entry: RequestLogEntry) -> Result<()> {
        self.push(entry);
        Ok(())
    }

    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.write();
        let len = entries.len();
        entries.retain(|e| e.timestamp >= before);
        Ok((len - entries.len()) as u64)
    }
}
