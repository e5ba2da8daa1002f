use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use hivepost_shared::{CommunityId, NewPost, Post, PostId};
use tracing::{debug, info};

use crate::auth::AuthContext;
use crate::cache::{QueryCache, QueryKey};
use crate::error::{Result, SyncError};
use crate::gateway::RemoteGateway;

/// What the author typed in the create-post form.
#[derive(Debug, Clone, Default)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    pub community_id: Option<CommunityId>,
}

/// An image picked for upload.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    pub async fn read(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::Invalid(format!("not a file: {}", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SyncError::Invalid(format!("cannot read {}: {e}", path.display())))?;
        Ok(Self { name, bytes })
    }
}

/// Lowercase, ASCII alphanumerics kept, every other run collapsed to `-`.
pub fn slugify_title(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Object path for a post image: `<slug>-<unix millis>-<file name>`.
pub fn image_path(title: &str, millis: u128, file_name: &str) -> String {
    format!("{}-{millis}-{file_name}", slugify_title(title))
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct PostService {
    gateway: Arc<dyn RemoteGateway>,
    cache: QueryCache,
    auth: Arc<AuthContext>,
}

impl PostService {
    pub fn new(cache: QueryCache, auth: Arc<AuthContext>) -> Self {
        Self {
            gateway: cache.gateway().clone(),
            cache,
            auth,
        }
    }

    /// All posts, newest first, with like and comment counts.
    pub async fn list(&self) -> Result<Vec<Post>> {
        self.cache.posts(None).await
    }

    pub async fn by_community(&self, community_id: CommunityId) -> Result<Vec<Post>> {
        self.cache.posts(Some(community_id)).await
    }

    pub async fn get(&self, post_id: PostId) -> Result<Post> {
        self.cache.post(post_id).await
    }

    /// Uploads the image, then inserts the post pointing at its public URL.
    pub async fn create(&self, draft: PostDraft, image: ImageFile) -> Result<Post> {
        let author = self.auth.current_user().ok_or(SyncError::Unauthenticated)?;
        if draft.title.trim().is_empty() {
            return Err(SyncError::Invalid("title must not be empty".into()));
        }
        if draft.content.trim().is_empty() {
            return Err(SyncError::Invalid("content must not be empty".into()));
        }
        if image.bytes.is_empty() {
            return Err(SyncError::Invalid("image must not be empty".into()));
        }

        let path = image_path(&draft.title, unix_millis(), &image.name);
        let image_url = self.gateway.upload_image(&path, image.bytes).await?;
        debug!(%path, %image_url, "post image stored");

        let post = self
            .gateway
            .insert_post(NewPost {
                title: draft.title,
                content: draft.content,
                image_url,
                avatar_url: (!author.avatar_url.is_empty()).then_some(author.avatar_url),
                community_id: draft.community_id,
            })
            .await?;
        info!(post_id = post.id, "post created");

        self.cache.invalidate_where(QueryKey::shows_post_counts);
        Ok(post)
    }
}
