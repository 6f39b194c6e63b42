use crate::error::{EntityKind, OrchestratorError};
use crate::types::Identity;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Resolves a user id into an explicit identity (user + groups).
///
/// There is no ambient "current user": every orchestration call resolves
/// the caller once and threads the result through.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<Identity, OrchestratorError>;
}

/// Identity provider backed by the `identities` config table.
pub struct StaticIdentityProvider {
    groups: BTreeMap<String, Vec<String>>,
}

impl StaticIdentityProvider {
    pub fn new(groups: BTreeMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn resolve(&self, user_id: &str) -> Result<Identity, OrchestratorError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(OrchestratorError::not_found(EntityKind::User, user_id));
        }
        let groups = self.groups.get(user_id).cloned().unwrap_or_default();
        Ok(Identity::new(user_id).with_groups(groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_known_and_unknown() {
        let mut table = BTreeMap::new();
        table.insert("bob".to_string(), vec!["managers".to_string()]);
        let provider = StaticIdentityProvider::new(table);

        let bob = provider.resolve("bob").await.unwrap();
        assert!(bob.in_group("managers"));

        let eve = provider.resolve("eve").await.unwrap();
        assert_eq!(eve.user_id, "eve");
        assert!(eve.groups.is_empty());
    }

    #[tokio::test]
    async fn test_blank_user_rejected() {
        let provider = StaticIdentityProvider::default();
        let err = provider.resolve("  ").await.unwrap_err();
        assert!(err.is_not_found(EntityKind::User));
    }
}
