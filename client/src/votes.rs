use std::sync::Arc;

use hivepost_shared::{PostId, Tally, VoteValue};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::AuthContext;
use crate::cache::{LiveQuery, QueryCache, QueryKey};
use crate::error::{Result, SyncError};
use crate::gateway::RemoteGateway;
use crate::reconcile::{apply, resolve_vote, VoteAction};

/// Casts votes and reads tallies for the signed-in user.
#[derive(Clone)]
pub struct VoteService {
    gateway: Arc<dyn RemoteGateway>,
    cache: QueryCache,
    auth: Arc<AuthContext>,
}

impl VoteService {
    pub fn new(cache: QueryCache, auth: Arc<AuthContext>) -> Self {
        Self {
            gateway: cache.gateway().clone(),
            cache,
            auth,
        }
    }

    /// Turns a click into one write against the platform.
    ///
    /// The user's prior vote is read fresh from the gateway, not from the
    /// cache, so a stale tally never picks the wrong action.
    pub async fn cast(&self, post_id: PostId, value: VoteValue) -> Result<VoteAction> {
        let user_id = self.auth.user_id().ok_or(SyncError::Unauthenticated)?;

        let votes = self.gateway.list_votes(post_id).await?;
        let existing = votes.iter().find(|v| v.user_id == user_id);
        let action = resolve_vote(value, post_id, Some(&user_id), existing)?;

        apply(self.gateway.as_ref(), &action).await?;
        info!(post_id, %value, ?action, "vote applied");

        self.cache.invalidate(&QueryKey::Votes(post_id));
        self.cache.invalidate_where(QueryKey::shows_post_counts);
        Ok(action)
    }

    pub async fn tally(&self, post_id: PostId) -> Result<Tally> {
        let votes = self.cache.votes(post_id).await?;
        Ok(Tally::from_votes(&votes, self.auth.user_id().as_deref()))
    }

    /// Keeps the post's votes fresh on the live refresh interval.
    pub fn watch(&self, post_id: PostId) -> LiveQuery {
        self.cache.watch(QueryKey::Votes(post_id))
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PanelState {
    pub tally: Tally,
    pub pending: bool,
    pub error: Option<SyncError>,
}

/// One like/dislike control.
///
/// A click shows its outcome right away, then settles on what the platform
/// reports. A rejected vote puts the previous tally back and keeps the error.
pub struct VotePanel {
    post_id: PostId,
    service: VoteService,
    state: watch::Sender<PanelState>,
}

impl VotePanel {
    pub async fn load(service: VoteService, post_id: PostId) -> Result<Self> {
        let tally = service.tally(post_id).await?;
        let state = watch::channel(PanelState {
            tally,
            ..PanelState::default()
        })
        .0;
        Ok(Self {
            post_id,
            service,
            state,
        })
    }

    pub fn post_id(&self) -> PostId {
        self.post_id
    }

    pub fn state(&self) -> PanelState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PanelState> {
        self.state.subscribe()
    }

    pub fn like_enabled(&self) -> bool {
        self.service.auth().is_signed_in() && !self.state.borrow().pending
    }

    pub async fn like(&self) -> Result<VoteAction> {
        self.click(VoteValue::Up).await
    }

    pub async fn dislike(&self) -> Result<VoteAction> {
        self.click(VoteValue::Down).await
    }

    pub async fn click(&self, value: VoteValue) -> Result<VoteAction> {
        if !self.service.auth().is_signed_in() {
            self.state
                .send_modify(|s| s.error = Some(SyncError::Unauthenticated));
            return Err(SyncError::Unauthenticated);
        }

        let prior = self.state.borrow().tally;
        self.state.send_modify(|s| {
            s.tally = prior.toggled(value);
            s.pending = true;
            s.error = None;
        });

        let action = match self.service.cast(self.post_id, value).await {
            Ok(action) => action,
            Err(err) => {
                warn!(post_id = self.post_id, error = %err, "vote failed, rolling back");
                self.state.send_modify(|s| {
                    s.tally = prior;
                    s.pending = false;
                    s.error = Some(err.clone());
                });
                return Err(err);
            }
        };

        match self.service.tally(self.post_id).await {
            Ok(tally) => self.state.send_modify(|s| {
                s.tally = tally;
                s.pending = false;
            }),
            Err(err) => {
                // The vote landed; only the confirmation read failed.
                debug!(post_id = self.post_id, error = %err, "tally refresh failed");
                self.state.send_modify(|s| {
                    s.pending = false;
                    s.error = Some(err);
                });
            }
        }
        Ok(action)
    }

    /// Re-reads the tally, e.g. after a live refresh.
    pub async fn refresh(&self) -> Result<Tally> {
        let tally = self.service.tally(self.post_id).await?;
        self.state.send_modify(|s| s.tally = tally);
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use hivepost_shared::User;
    use std::time::Duration;

    async fn setup(signed_in: bool) -> (Arc<MemoryGateway>, VoteService, PostId) {
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
        (gateway, VoteService::new(cache, auth), post_id)
    }

    #[tokio::test]
    async fn like_then_like_again_leaves_no_vote() {
        let (gateway, votes, post_id) = setup(true).await;

        let first = votes.cast(post_id, VoteValue::Up).await.unwrap();
        assert!(matches!(first, VoteAction::Insert { .. }));
        assert_eq!(votes.tally(post_id).await.unwrap().likes, 1);

        let second = votes.cast(post_id, VoteValue::Up).await.unwrap();
        assert!(matches!(second, VoteAction::Delete { .. }));
        assert_eq!(votes.tally(post_id).await.unwrap(), Tally::default());
        assert!(gateway.votes_by(post_id, "u1").is_empty());
    }

    #[tokio::test]
    async fn switching_updates_the_existing_row() {
        let (gateway, votes, post_id) = setup(true).await;
        let vote_id = gateway.seed_vote(post_id, "u1", VoteValue::Up);

        let action = votes.cast(post_id, VoteValue::Down).await.unwrap();
        assert_eq!(
            action,
            VoteAction::Update {
                vote_id,
                value: VoteValue::Down
            }
        );
        let tally = votes.tally(post_id).await.unwrap();
        assert_eq!((tally.likes, tally.dislikes), (0, 1));
        assert_eq!(tally.user_vote, Some(VoteValue::Down));
        assert_eq!(gateway.votes_by(post_id, "u1").len(), 1);
    }

    #[tokio::test]
    async fn anonymous_cast_writes_nothing() {
        let (gateway, votes, post_id) = setup(false).await;

        assert_eq!(
            votes.cast(post_id, VoteValue::Up).await,
            Err(SyncError::Unauthenticated)
        );
        assert_eq!(gateway.calls("list_votes"), 0);
        assert_eq!(gateway.calls("insert_vote"), 0);
    }

    #[tokio::test]
    async fn cast_refreshes_a_cached_tally_immediately() {
        let (_, votes, post_id) = setup(true).await;
        assert_eq!(votes.tally(post_id).await.unwrap().likes, 0);

        votes.cast(post_id, VoteValue::Up).await.unwrap();
        assert_eq!(votes.tally(post_id).await.unwrap().likes, 1);
    }

    #[tokio::test]
    async fn panel_settles_on_platform_tally() {
        let (_, votes, post_id) = setup(true).await;
        let panel = VotePanel::load(votes, post_id).await.unwrap();
        assert!(panel.like_enabled());

        panel.like().await.unwrap();
        let state = panel.state();
        assert_eq!(state.tally.likes, 1);
        assert_eq!(state.tally.user_vote, Some(VoteValue::Up));
        assert!(!state.pending);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn panel_rolls_back_a_failed_vote() {
        let (gateway, votes, post_id) = setup(true).await;
        gateway.seed_vote(post_id, "u2", VoteValue::Up);
        let panel = VotePanel::load(votes, post_id).await.unwrap();
        let before = panel.state().tally;

        gateway.fail_next("insert_vote", SyncError::RemoteFailure("down".into()));
        let err = panel.like().await.unwrap_err();

        let state = panel.state();
        assert_eq!(state.tally, before);
        assert_eq!(state.error, Some(err));
        assert!(!state.pending);
    }

    #[tokio::test]
    async fn anonymous_panel_is_disabled() {
        let (gateway, votes, post_id) = setup(false).await;
        let panel = VotePanel::load(votes, post_id).await.unwrap();

        assert!(!panel.like_enabled());
        assert_eq!(panel.dislike().await, Err(SyncError::Unauthenticated));
        assert_eq!(panel.state().tally, Tally::default());
        assert_eq!(gateway.calls("insert_vote"), 0);
    }
}
