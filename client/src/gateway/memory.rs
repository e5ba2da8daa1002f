use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use hivepost_shared::{
    Comment, Community, CommunityId, NewComment, NewCommunity, NewPost, Post, PostId, User, Vote,
    VoteId, VoteValue, POST_IMAGES_BUCKET,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{RemoteGateway, SessionEvent};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
struct PostRow {
    id: PostId,
    title: String,
    content: String,
    image_url: String,
    avatar_url: Option<String>,
    community_id: Option<CommunityId>,
    created_at: String,
}

#[derive(Default)]
struct Store {
    tokens: HashMap<String, User>,
    session: Option<User>,
    posts: Vec<PostRow>,
    votes: Vec<Vote>,
    communities: Vec<Community>,
    comments: Vec<Comment>,
    objects: HashMap<String, Vec<u8>>,
    next_id: i64,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, SyncError>,
}

impl Store {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn timestamp(&self) -> String {
        format!("2024-01-01T00:00:00.{:06}Z", self.next_id)
    }

    /// Counts the call and hands back an injected failure, if one is armed.
    fn enter(&mut self, op: &'static str) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn signed_in(&self) -> Result<&User> {
        self.session.as_ref().ok_or(SyncError::Unauthenticated)
    }

    fn post_view(&self, row: &PostRow) -> Post {
        Post {
            id: row.id,
            title: row.title.clone(),
            content: row.content.clone(),
            image_url: row.image_url.clone(),
            avatar_url: row.avatar_url.clone(),
            created_at: row.created_at.clone(),
            community_id: row.community_id,
            community_name: row
                .community_id
                .and_then(|id| self.communities.iter().find(|c| c.id == id))
                .map(|c| c.name.clone()),
            like_count: self
                .votes
                .iter()
                .filter(|v| v.post_id == row.id && v.value == VoteValue::Up)
                .count() as i64,
            comment_count: self.comments.iter().filter(|c| c.post_id == row.id).count() as i64,
        }
    }
}

/// An in-process stand-in for the platform with the same constraints
/// (one vote per post and user, unique community names, owner-only vote edits).
///
/// Counts calls per operation and can be told to fail the next call of an
/// operation, which makes it the gateway of choice for exercising the cache
/// and the vote flow without a network.
pub struct MemoryGateway {
    store: Mutex<Store>,
    latency: Option<Duration>,
    sessions: broadcast::Sender<SessionEvent>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            latency: None,
            sessions: broadcast::channel(16).0,
        }
    }

    /// Every operation sleeps this long before touching the store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Registers `user`, reachable through `sign_in(token)`.
    pub fn register(&self, token: &str, user: User) {
        self.store.lock().tokens.insert(token.to_string(), user);
    }

    /// Puts `user` in session without emitting a session event.
    pub fn set_session(&self, user: Option<User>) {
        self.store.lock().session = user;
    }

    /// Simulates the platform dropping the session (expiry, sign-out elsewhere).
    pub fn expire_session(&self) {
        self.store.lock().session = None;
        let _ = self.sessions.send(SessionEvent::SignedOut);
    }

    pub fn seed_post(&self, title: &str, community_id: Option<CommunityId>) -> PostId {
        let mut store = self.store.lock();
        let id = store.next_id();
        let created_at = store.timestamp();
        store.posts.push(PostRow {
            id,
            title: title.to_string(),
            content: format!("{title} body"),
            image_url: format!("memory://{POST_IMAGES_BUCKET}/{id}.png"),
            avatar_url: None,
            community_id,
            created_at,
        });
        id
    }

    /// Writes a vote row directly, as another client would.
    pub fn seed_vote(&self, post_id: PostId, user_id: &str, value: VoteValue) -> VoteId {
        let mut store = self.store.lock();
        let id = store.next_id();
        store.votes.push(Vote {
            id,
            post_id,
            user_id: user_id.to_string(),
            value,
        });
        id
    }

    /// Number of times `op` (a trait method name) has been called.
    pub fn calls(&self, op: &str) -> usize {
        self.store.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Makes the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: &'static str, err: SyncError) {
        self.store.lock().failures.insert(op, err);
    }

    pub fn votes_by(&self, post_id: PostId, user_id: &str) -> Vec<Vote> {
        self.store
            .lock()
            .votes
            .iter()
            .filter(|v| v.post_id == post_id && v.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.store.lock().objects.get(path).cloned()
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn insert_vote(&self, post_id: PostId, user_id: &str, value: VoteValue) -> Result<Vote> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("insert_vote")?;
        if store.signed_in()?.id != user_id {
            return Err(SyncError::RemoteFailure("permission denied for votes".into()));
        }
        if !store.posts.iter().any(|p| p.id == post_id) {
            return Err(SyncError::NotFound(format!("post {post_id}")));
        }
        if store
            .votes
            .iter()
            .any(|v| v.post_id == post_id && v.user_id == user_id)
        {
            return Err(SyncError::RemoteFailure(
                "duplicate key value violates unique constraint on (post_id, user_id)".into(),
            ));
        }
        let vote = Vote {
            id: store.next_id(),
            post_id,
            user_id: user_id.to_string(),
            value,
        };
        store.votes.push(vote.clone());
        Ok(vote)
    }

    async fn update_vote(&self, vote_id: VoteId, value: VoteValue) -> Result<Vote> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("update_vote")?;
        let user_id = store.signed_in()?.id.clone();
        let vote = store
            .votes
            .iter_mut()
            .find(|v| v.id == vote_id && v.user_id == user_id)
            .ok_or_else(|| SyncError::NotFound(format!("vote {vote_id}")))?;
        vote.value = value;
        Ok(vote.clone())
    }

    async fn delete_vote(&self, vote_id: VoteId) -> Result<()> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("delete_vote")?;
        let user_id = store.signed_in()?.id.clone();
        let before = store.votes.len();
        store
            .votes
            .retain(|v| !(v.id == vote_id && v.user_id == user_id));
        if store.votes.len() == before {
            return Err(SyncError::NotFound(format!("vote {vote_id}")));
        }
        Ok(())
    }

    async fn list_votes(&self, post_id: PostId) -> Result<Vec<Vote>> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("list_votes")?;
        Ok(store
            .votes
            .iter()
            .filter(|v| v.post_id == post_id)
            .cloned()
            .collect())
    }

    async fn list_posts(&self, community: Option<CommunityId>) -> Result<Vec<Post>> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("list_posts")?;
        let mut posts: Vec<Post> = store
            .posts
            .iter()
            .filter(|p| community.is_none() || p.community_id == community)
            .map(|p| store.post_view(p))
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(posts)
    }

    async fn get_post(&self, post_id: PostId) -> Result<Post> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("get_post")?;
        store
            .posts
            .iter()
            .find(|p| p.id == post_id)
            .map(|p| store.post_view(p))
            .ok_or_else(|| SyncError::NotFound(format!("post {post_id}")))
    }

    async fn insert_post(&self, post: NewPost) -> Result<Post> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("insert_post")?;
        store.signed_in()?;
        if let Some(id) = post.community_id {
            if !store.communities.iter().any(|c| c.id == id) {
                return Err(SyncError::NotFound(format!("community {id}")));
            }
        }
        let row = PostRow {
            id: store.next_id(),
            title: post.title,
            content: post.content,
            image_url: post.image_url,
            avatar_url: post.avatar_url,
            community_id: post.community_id,
            created_at: store.timestamp(),
        };
        let view = store.post_view(&row);
        store.posts.push(row);
        Ok(view)
    }

    async fn list_communities(&self) -> Result<Vec<Community>> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("list_communities")?;
        Ok(store.communities.iter().rev().cloned().collect())
    }

    async fn insert_community(&self, community: NewCommunity) -> Result<Community> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("insert_community")?;
        store.signed_in()?;
        if store.communities.iter().any(|c| c.name == community.name) {
            return Err(SyncError::RemoteFailure(
                "community with this name already exists".into(),
            ));
        }
        let row = Community {
            id: store.next_id(),
            name: community.name,
            description: community.description,
            created_at: store.timestamp(),
        };
        store.communities.push(row.clone());
        Ok(row)
    }

    async fn list_comments(&self, post_id: PostId) -> Result<Vec<Comment>> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("list_comments")?;
        Ok(store
            .comments
            .iter()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect())
    }

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("insert_comment")?;
        let author = store.signed_in()?.clone();
        if !store.posts.iter().any(|p| p.id == comment.post_id) {
            return Err(SyncError::NotFound(format!("post {}", comment.post_id)));
        }
        if let Some(parent) = comment.parent_comment_id {
            if !store
                .comments
                .iter()
                .any(|c| c.id == parent && c.post_id == comment.post_id)
            {
                return Err(SyncError::NotFound(format!("comment {parent}")));
            }
        }
        let row = Comment {
            id: store.next_id(),
            post_id: comment.post_id,
            parent_comment_id: comment.parent_comment_id,
            content: comment.content,
            user_id: author.id,
            author: author.username,
            created_at: store.timestamp(),
        };
        store.comments.push(row.clone());
        Ok(row)
    }

    async fn upload_image(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("upload_image")?;
        store.signed_in()?;
        if store.objects.contains_key(path) {
            return Err(SyncError::RemoteFailure("object at this path already exists".into()));
        }
        store.objects.insert(path.to_string(), bytes);
        Ok(format!("memory://{POST_IMAGES_BUCKET}/{path}"))
    }

    async fn current_user(&self) -> Result<Option<User>> {
        self.pause().await;
        let mut store = self.store.lock();
        store.enter("current_user")?;
        Ok(store.session.clone())
    }

    async fn sign_in(&self, token: &str) -> Result<User> {
        self.pause().await;
        let user = {
            let mut store = self.store.lock();
            store.enter("sign_in")?;
            let user = store
                .tokens
                .get(token)
                .cloned()
                .ok_or(SyncError::Unauthenticated)?;
            store.session = Some(user.clone());
            user
        };
        let _ = self.sessions.send(SessionEvent::SignedIn(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        self.pause().await;
        {
            let mut store = self.store.lock();
            store.enter("sign_out")?;
            store.session = None;
        }
        let _ = self.sessions.send(SessionEvent::SignedOut);
        Ok(())
    }

    fn sign_in_url(&self, redirect: &str) -> String {
        format!("memory://sign-in?redirect={redirect}")
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }
}
