//! Client for the hivepost platform: vote reconciliation, a keyed query
//! cache with live refresh, and the services a front end drives.

pub mod auth;
pub mod cache;
pub mod comments;
pub mod communities;
pub mod config;
pub mod error;
pub mod gateway;
pub mod posts;
pub mod reconcile;
pub mod votes;

use std::sync::Arc;

pub use auth::AuthContext;
pub use cache::{LiveQuery, QueryCache, QueryData, QueryKey, QueryState, QueryStatus, RefreshPolicy};
pub use comments::{build_tree, CommentNode, CommentService};
pub use communities::CommunityService;
pub use config::ClientConfig;
pub use error::{Result, SyncError};
pub use gateway::{HttpGateway, MemoryGateway, RemoteGateway, SessionEvent};
pub use posts::{ImageFile, PostDraft, PostService};
pub use reconcile::{resolve_vote, VoteAction};
pub use votes::{PanelState, VotePanel, VoteService};

/// Everything wired to one gateway: session, cache and services.
pub struct Hivepost {
    pub auth: Arc<AuthContext>,
    pub cache: QueryCache,
    pub votes: VoteService,
    pub posts: PostService,
    pub communities: CommunityService,
    pub comments: CommentService,
}

impl Hivepost {
    pub async fn start(gateway: Arc<dyn RemoteGateway>, config: &ClientConfig) -> Result<Self> {
        let auth = Arc::new(AuthContext::start(gateway.clone()).await?);
        let cache = QueryCache::new(gateway, config.live_refresh);
        Ok(Self {
            votes: VoteService::new(cache.clone(), auth.clone()),
            posts: PostService::new(cache.clone(), auth.clone()),
            communities: CommunityService::new(cache.clone(), auth.clone()),
            comments: CommentService::new(cache.clone(), auth.clone()),
            auth,
            cache,
        })
    }

    pub fn shutdown(&self) {
        self.auth.shutdown();
    }
}
