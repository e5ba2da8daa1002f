use std::{collections::HashMap, sync::Arc};

use hivepost_shared::{Comment, CommentId, NewComment, PostId};
use tracing::info;

use crate::auth::AuthContext;
use crate::cache::{QueryCache, QueryKey};
use crate::error::{Result, SyncError};
use crate::gateway::RemoteGateway;

/// A comment with its replies, oldest first at every level.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    /// This comment plus all nested replies.
    pub fn thread_len(&self) -> usize {
        1 + self.replies.iter().map(CommentNode::thread_len).sum::<usize>()
    }
}

/// Arranges a flat comment list into threads.
///
/// A comment whose parent is missing from `comments` becomes a root.
pub fn build_tree(comments: &[Comment]) -> Vec<CommentNode> {
    let known: HashMap<CommentId, usize> = comments
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect();

    let mut children: HashMap<CommentId, Vec<&Comment>> = HashMap::new();
    let mut roots = Vec::new();
    for comment in comments {
        match comment.parent_comment_id {
            Some(parent) if parent != comment.id && known.contains_key(&parent) => {
                children.entry(parent).or_default().push(comment)
            }
            _ => roots.push(comment),
        }
    }

    fn attach(comment: &Comment, children: &HashMap<CommentId, Vec<&Comment>>) -> CommentNode {
        let mut replies: Vec<CommentNode> = children
            .get(&comment.id)
            .map(|kids| kids.iter().map(|c| attach(c, children)).collect())
            .unwrap_or_default();
        replies.sort_by(|a, b| {
            (&a.comment.created_at, a.comment.id).cmp(&(&b.comment.created_at, b.comment.id))
        });
        CommentNode {
            comment: comment.clone(),
            replies,
        }
    }

    let mut tree: Vec<CommentNode> = roots.into_iter().map(|c| attach(c, &children)).collect();
    tree.sort_by(|a, b| {
        (&a.comment.created_at, a.comment.id).cmp(&(&b.comment.created_at, b.comment.id))
    });
    tree
}

#[derive(Clone)]
pub struct CommentService {
    gateway: Arc<dyn RemoteGateway>,
    cache: QueryCache,
    auth: Arc<AuthContext>,
}

impl CommentService {
    pub fn new(cache: QueryCache, auth: Arc<AuthContext>) -> Self {
        Self {
            gateway: cache.gateway().clone(),
            cache,
            auth,
        }
    }

    pub async fn list(&self, post_id: PostId) -> Result<Vec<Comment>> {
        self.cache.comments(post_id).await
    }

    pub async fn tree(&self, post_id: PostId) -> Result<Vec<CommentNode>> {
        Ok(build_tree(&self.list(post_id).await?))
    }

    pub async fn create(
        &self,
        post_id: PostId,
        content: &str,
        parent_comment_id: Option<CommentId>,
    ) -> Result<Comment> {
        if !self.auth.is_signed_in() {
            return Err(SyncError::Unauthenticated);
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Invalid("comment must not be empty".into()));
        }

        let comment = self
            .gateway
            .insert_comment(NewComment {
                post_id,
                content: content.to_string(),
                parent_comment_id,
            })
            .await?;
        info!(post_id, comment_id = comment.id, "comment added");

        self.cache.invalidate(&QueryKey::Comments(post_id));
        self.cache.invalidate_where(QueryKey::shows_post_counts);
        Ok(comment)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gateway::MemoryGateway;
    use hivepost_shared::User;

    fn comment(id: CommentId, parent: Option<CommentId>) -> Comment {
        Comment {
            id,
            post_id: 1,
            parent_comment_id: parent,
            content: format!("c{id}"),
            user_id: "u1".into(),
            author: "alice".into(),
            created_at: format!("2024-01-01T00:00:{id:02}Z"),
        }
    }

    #[test]
    fn builds_nested_threads() {
        let flat = vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, Some(2)),
            comment(4, None),
            comment(5, Some(1)),
        ];
        let tree = build_tree(&flat);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].comment.id, 1);
        assert_eq!(tree[0].thread_len(), 4);
        let replies: Vec<_> = tree[0].replies.iter().map(|n| n.comment.id).collect();
        assert_eq!(replies, vec![2, 5]);
        assert_eq!(tree[0].replies[0].replies[0].comment.id, 3);
        assert_eq!(tree[1].comment.id, 4);
    }

    #[test]
    fn orphans_become_roots() {
        let tree = build_tree(&[comment(2, Some(99)), comment(3, Some(2))]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].comment.id, 2);
        assert_eq!(tree[0].replies[0].comment.id, 3);
    }

    async fn setup(signed_in: bool) -> (Arc<MemoryGateway>, CommentService, PostId) {
        let gateway = Arc::new(MemoryGateway::new());
        if signed_in {
            gateway.set_session(Some(User {
                id: "u1".into(),
                username: "alice".into(),
                avatar_url: String::new(),
            }));
        }
        let post_id = gateway.seed_post("hello", None);
        let cache = QueryCache::new(gateway.clone(), Duration::from_secs(5));
        let auth = Arc::new(AuthContext::start(gateway.clone()).await.unwrap());
        (gateway, CommentService::new(cache, auth), post_id)
    }

    #[tokio::test]
    async fn reply_shows_up_in_cached_tree() {
        let (_, comments, post_id) = setup(true).await;
        assert!(comments.tree(post_id).await.unwrap().is_empty());

        let root = comments.create(post_id, "first!", None).await.unwrap();
        comments.create(post_id, "reply", Some(root.id)).await.unwrap();

        let tree = comments.tree(post_id).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].comment.author, "alice");
        assert_eq!(tree[0].replies[0].comment.content, "reply");
    }

    #[tokio::test]
    async fn create_checks_session_and_content() {
        let (gateway, comments, post_id) = setup(false).await;
        assert_eq!(
            comments.create(post_id, "hi", None).await,
            Err(SyncError::Unauthenticated)
        );

        gateway.set_session(Some(User {
            id: "u1".into(),
            username: "alice".into(),
            avatar_url: String::new(),
        }));
        // The auth context only learns about sessions through events.
        assert_eq!(
            comments.create(post_id, "hi", None).await,
            Err(SyncError::Unauthenticated)
        );
        assert_eq!(gateway.calls("insert_comment"), 0);
    }

    #[tokio::test]
    async fn blank_comment_is_invalid() {
        let (gateway, comments, post_id) = setup(true).await;
        assert!(matches!(
            comments.create(post_id, " \n", None).await,
            Err(SyncError::Invalid(_))
        ));
        assert_eq!(gateway.calls("insert_comment"), 0);
    }
}
