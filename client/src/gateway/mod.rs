//! The boundary to the hosted platform.
//!
//! Everything the client knows about posts, votes, communities, comments and
//! the signed-in user comes through a [`RemoteGateway`]. The platform owns the
//! data; the gateway only moves it.

mod http;
mod memory;

pub use http::{HttpGateway, TokenStore};
pub use memory::MemoryGateway;

use async_trait::async_trait;
use hivepost_shared::{
    Comment, Community, CommunityId, NewComment, NewCommunity, NewPost, Post, PostId, User, Vote,
    VoteId, VoteValue,
};
use tokio::sync::broadcast;

use crate::error::Result;

/// Session changes pushed by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(User),
    SignedOut,
}

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn insert_vote(&self, post_id: PostId, user_id: &str, value: VoteValue) -> Result<Vote>;

    async fn update_vote(&self, vote_id: VoteId, value: VoteValue) -> Result<Vote>;

    async fn delete_vote(&self, vote_id: VoteId) -> Result<()>;

    async fn list_votes(&self, post_id: PostId) -> Result<Vec<Vote>>;

    /// Newest first, with derived like/comment counts.
    async fn list_posts(&self, community: Option<CommunityId>) -> Result<Vec<Post>>;

    async fn get_post(&self, post_id: PostId) -> Result<Post>;

    async fn insert_post(&self, post: NewPost) -> Result<Post>;

    async fn list_communities(&self) -> Result<Vec<Community>>;

    async fn insert_community(&self, community: NewCommunity) -> Result<Community>;

    async fn list_comments(&self, post_id: PostId) -> Result<Vec<Comment>>;

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment>;

    /// Stores `bytes` in the post image bucket and returns its public URL.
    async fn upload_image(&self, path: &str, bytes: Vec<u8>) -> Result<String>;

    async fn current_user(&self) -> Result<Option<User>>;

    /// Adopts a session token issued by the platform's OAuth redirect.
    async fn sign_in(&self, token: &str) -> Result<User>;

    async fn sign_out(&self) -> Result<()>;

    /// URL that starts the platform's OAuth flow and returns to `redirect`.
    fn sign_in_url(&self, redirect: &str) -> String;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
