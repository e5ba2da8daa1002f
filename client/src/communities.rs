use std::sync::Arc;

use hivepost_shared::{Community, NewCommunity};
use tracing::info;

use crate::auth::AuthContext;
use crate::cache::{QueryCache, QueryKey};
use crate::error::{Result, SyncError};
use crate::gateway::RemoteGateway;

#[derive(Clone)]
pub struct CommunityService {
    gateway: Arc<dyn RemoteGateway>,
    cache: QueryCache,
    auth: Arc<AuthContext>,
}

impl CommunityService {
    pub fn new(cache: QueryCache, auth: Arc<AuthContext>) -> Self {
        Self {
            gateway: cache.gateway().clone(),
            cache,
            auth,
        }
    }

    pub async fn list(&self) -> Result<Vec<Community>> {
        self.cache.communities().await
    }

    /// Names are unique on the platform; a duplicate comes back as a remote failure.
    pub async fn create(&self, name: &str, description: &str) -> Result<Community> {
        if !self.auth.is_signed_in() {
            return Err(SyncError::Unauthenticated);
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::Invalid("community name must not be empty".into()));
        }

        let community = self
            .gateway
            .insert_community(NewCommunity {
                name: name.to_string(),
                description: description.trim().to_string(),
            })
            .await?;
        info!(community_id = community.id, name = %community.name, "community created");

        self.cache.invalidate(&QueryKey::Communities);
        Ok(community)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gateway::MemoryGateway;
    use hivepost_shared::User;

    async fn setup() -> (Arc<MemoryGateway>, CommunityService) {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.set_session(Some(User {
            id: "u1".into(),
            username: "alice".into(),
            avatar_url: String::new(),
        }));
        let cache = QueryCache::new(gateway.clone(), Duration::from_secs(5));
        let auth = Arc::new(AuthContext::start(gateway.clone()).await.unwrap());
        (gateway, CommunityService::new(cache, auth))
    }

    #[tokio::test]
    async fn created_community_is_listed() {
        let (_, communities) = setup().await;
        assert!(communities.list().await.unwrap().is_empty());

        let rust = communities.create("  rust ", "crabs").await.unwrap();
        assert_eq!(rust.name, "rust");
        assert_eq!(communities.list().await.unwrap(), vec![rust]);
    }

    #[tokio::test]
    async fn duplicate_and_blank_names_fail() {
        let (gateway, communities) = setup().await;
        communities.create("rust", "").await.unwrap();

        assert!(matches!(
            communities.create("rust", "again").await,
            Err(SyncError::RemoteFailure(_))
        ));
        assert!(matches!(
            communities.create(" ", "").await,
            Err(SyncError::Invalid(_))
        ));
        assert_eq!(gateway.calls("insert_community"), 2);
    }
}
