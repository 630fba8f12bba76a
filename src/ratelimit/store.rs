//! Policy store: read access to endpoint, user and role policies.
//!
//! The [`PolicyStore`] trait is the seam between the resolver and wherever
//! policies live. [`InMemoryPolicyStore`] keeps a [`PolicySet`] loaded from
//! YAML; the SQLite backend lives in [`crate::db`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::policy::{
    best_endpoint_match, EndpointLimitPolicy, MethodMatch, PathPattern, Role, RoleLimitPolicy,
    UserLimitPolicy,
};
use crate::error::{Result, WardenError};

/// Read-only accessor over the three policy tables.
///
/// User and role lookups only return enabled policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// The most specific endpoint policy for `path` and `method`, if any.
    async fn find_endpoint_policy(
        &self,
        path: &str,
        method: &str,
    ) -> Result<Option<EndpointLimitPolicy>>;

    /// The enabled override for `user_id`, if any.
    async fn find_user_policy(&self, user_id: &str) -> Result<Option<UserLimitPolicy>>;

    /// The enabled default for `role`, if any.
    async fn find_role_policy(&self, role: &Role) -> Result<Option<RoleLimitPolicy>>;
}

/// A complete set of policies, as stored in a policy file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub roles: Vec<RoleLimitPolicy>,
    #[serde(default)]
    pub users: Vec<UserLimitPolicy>,
    #[serde(default)]
    pub endpoints: Vec<EndpointLimitPolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: PolicySet = serde_yaml::from_str(yaml)?;
        set.validate()?;
        Ok(set)
    }

    /// Reject duplicate user or role rows; at most one policy may exist per key.
    pub fn validate(&self) -> Result<()> {
        for (i, policy) in self.users.iter().enumerate() {
            if self.users[..i].iter().any(|p| p.user_id == policy.user_id) {
                return Err(WardenError::Config(format!(
                    "duplicate user policy for '{}'",
                    policy.user_id
                )));
            }
        }
        for (i, policy) in self.roles.iter().enumerate() {
            if self.roles[..i].iter().any(|p| p.role == policy.role) {
                return Err(WardenError::Config(format!(
                    "duplicate role policy for '{}'",
                    policy.role
                )));
            }
        }
        Ok(())
    }

    pub fn endpoint_policy(&self, path: &str, method: &str) -> Option<&EndpointLimitPolicy> {
        best_endpoint_match(&self.endpoints, path, method)
    }

    pub fn user_policy(&self, user_id: &str) -> Option<&UserLimitPolicy> {
        self.users
            .iter()
            .find(|p| p.enabled && p.user_id == user_id)
    }

    pub fn role_policy(&self, role: &Role) -> Option<&RoleLimitPolicy> {
        self.roles.iter().find(|p| p.enabled && &p.role == role)
    }
}

/// Policy store held in process memory.
///
/// Policies can be replaced or edited at runtime; readers see either the old
/// or the new set, never a partial update.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<PolicySet>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: PolicySet) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }

    /// Swap in a whole new policy set.
    pub fn replace(&self, policies: PolicySet) {
        *self.policies.write() = policies;
    }

    /// Snapshot of the current policies.
    pub fn policies(&self) -> PolicySet {
        self.policies.read().clone()
    }

    pub fn upsert_role_policy(&self, policy: RoleLimitPolicy) {
        let mut policies = self.policies.write();
        policies.roles.retain(|p| p.role != policy.role);
        policies.roles.push(policy);
    }

    pub fn upsert_user_policy(&self, policy: UserLimitPolicy) {
        let mut policies = self.policies.write();
        policies.users.retain(|p| p.user_id != policy.user_id);
        policies.users.push(policy);
    }

    /// Add or replace the endpoint policy with the same pattern and method.
    pub fn upsert_endpoint_policy(&self, policy: EndpointLimitPolicy) {
        let mut policies = self.policies.write();
        policies
            .endpoints
            .retain(|p| !(p.endpoint == policy.endpoint && p.method == policy.method));
        policies.endpoints.push(policy);
    }

    pub fn remove_user_policy(&self, user_id: &str) -> bool {
        let mut policies = self.policies.write();
        let before = policies.users.len();
        policies.users.retain(|p| p.user_id != user_id);
        policies.users.len() != before
    }

    pub fn remove_role_policy(&self, role: &Role) -> bool {
        let mut policies = self.policies.write();
        let before = policies.roles.len();
        policies.roles.retain(|p| &p.role != role);
        policies.roles.len() != before
    }

    pub fn remove_endpoint_policy(&self, endpoint: &PathPattern, method: &MethodMatch) -> bool {
        let mut policies = self.policies.write();
        let before = policies.endpoints.len();
        policies
            .endpoints
            .retain(|p| !(&p.endpoint == endpoint && &p.method == method));
        policies.endpoints.len() != before
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn find_endpoint_policy(
        &self,
        path: &str,
        method: &str,
    ) -> Result<Option<EndpointLimitPolicy>> {
        Ok(self.policies.read().endpoint_policy(path, method).cloned())
    }

    async fn find_user_policy(&self, user_id: &str) -> Result<Option<UserLimitPolicy>> {
        Ok(self.policies.read().user_policy(user_id).cloned())
    }

    async fn find_role_policy(&self, role: &Role) -> Result<Option<RoleLimitPolicy>> {
        Ok(self.policies.read().role_policy(role).cloned())
    }
}
