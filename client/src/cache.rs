//! Keyed query cache over the [`RemoteGateway`].
//!
//! Each [`QueryKey`] names one collection the client shows (votes of a post,
//! the post list, communities, ...). A read serves the cached value until the
//! key is invalidated, and concurrent reads of a key share one fetch.
//!
//! ```text
//! read(key) ──► fresh value? ──yes──► return it
//!                   │ no
//!                   ▼
//!            fetch in flight? ──yes──► await the same fetch
//!                   │ no
//!                   ▼
//!            start fetch, remember it as the key's pending fetch
//! ```
//!
//! Invalidation marks the key stale and detaches any pending fetch, so a
//! read that follows a write never settles on data fetched before it.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use hivepost_shared::{Comment, Community, CommunityId, Post, PostId, Vote};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use crate::error::{Result, SyncError};
use crate::gateway::RemoteGateway;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Votes(PostId),
    Posts,
    CommunityPosts(CommunityId),
    Post(PostId),
    Communities,
    Comments(PostId),
}

impl QueryKey {
    /// Keys whose data carries derived post counts (likes, comments).
    pub fn shows_post_counts(&self) -> bool {
        matches!(
            self,
            QueryKey::Posts | QueryKey::CommunityPosts(_) | QueryKey::Post(_)
        )
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Votes(id) => write!(f, "votes:{id}"),
            QueryKey::Posts => write!(f, "posts"),
            QueryKey::CommunityPosts(id) => write!(f, "community-posts:{id}"),
            QueryKey::Post(id) => write!(f, "post:{id}"),
            QueryKey::Communities => write!(f, "communities"),
            QueryKey::Comments(id) => write!(f, "comments:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Votes(Vec<Vote>),
    Posts(Vec<Post>),
    Post(Post),
    Communities(Vec<Community>),
    Comments(Vec<Comment>),
}

/// When a key is re-fetched without anyone reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Only after invalidation.
    OnInvalidate,
    /// On a fixed interval as well, standing in for a push channel.
    Every(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    Idle,
    Loading,
    Ready,
    Failed(SyncError),
}

/// What a [`LiveQuery`] currently shows.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
    Loading,
    Ready(Arc<QueryData>),
    Failed(SyncError),
}

type FetchResult = Result<Arc<QueryData>>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct Pending {
    id: u64,
    fetch: SharedFetch,
    waiters: usize,
}

#[derive(Default)]
struct Entry {
    value: Option<Arc<QueryData>>,
    stale: bool,
    error: Option<SyncError>,
    pending: Option<Pending>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.error.is_none() && self.pending.is_none()
    }
}

struct Inner {
    gateway: Arc<dyn RemoteGateway>,
    entries: Mutex<HashMap<QueryKey, Entry>>,
    next_fetch: AtomicU64,
    live_refresh: Duration,
    invalidations: broadcast::Sender<QueryKey>,
}

#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

async fn fetch(gateway: Arc<dyn RemoteGateway>, key: QueryKey) -> FetchResult {
    debug!(%key, "fetching");
    let data = match &key {
        QueryKey::Votes(post_id) => QueryData::Votes(gateway.list_votes(*post_id).await?),
        QueryKey::Posts => QueryData::Posts(gateway.list_posts(None).await?),
        QueryKey::CommunityPosts(id) => QueryData::Posts(gateway.list_posts(Some(*id)).await?),
        QueryKey::Post(post_id) => QueryData::Post(gateway.get_post(*post_id).await?),
        QueryKey::Communities => QueryData::Communities(gateway.list_communities().await?),
        QueryKey::Comments(post_id) => QueryData::Comments(gateway.list_comments(*post_id).await?),
    };
    Ok(Arc::new(data))
}

fn unexpected(key: &QueryKey) -> SyncError {
    SyncError::RemoteFailure(format!("unexpected payload cached under {key}"))
}

impl QueryCache {
    pub fn new(gateway: Arc<dyn RemoteGateway>, live_refresh: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                entries: Mutex::new(HashMap::new()),
                next_fetch: AtomicU64::new(0),
                live_refresh,
                invalidations: broadcast::channel(64).0,
            }),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteGateway> {
        &self.inner.gateway
    }

    /// Vote tallies poll; everything else waits for invalidation.
    pub fn refresh_policy(&self, key: &QueryKey) -> RefreshPolicy {
        match key {
            QueryKey::Votes(_) => RefreshPolicy::Every(self.inner.live_refresh),
            _ => RefreshPolicy::OnInvalidate,
        }
    }

    pub async fn read(&self, key: &QueryKey) -> FetchResult {
        let (fetch_id, pending) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(key.clone()).or_default();

            if !entry.stale {
                if let Some(value) = &entry.value {
                    trace!(%key, "cache hit");
                    return Ok(value.clone());
                }
            }

            match &mut entry.pending {
                Some(pending) => {
                    trace!(%key, "joining in-flight fetch");
                    pending.waiters += 1;
                    (pending.id, pending.fetch.clone())
                }
                None => {
                    let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed) + 1;
                    let shared = fetch(self.inner.gateway.clone(), key.clone())
                        .boxed()
                        .shared();
                    entry.pending = Some(Pending {
                        id,
                        fetch: shared.clone(),
                        waiters: 1,
                    });
                    (id, shared)
                }
            }
        };

        let _waiting = Waiter {
            cache: self,
            key,
            fetch_id,
        };
        let result = pending.await;
        self.settle(key, fetch_id, &result);
        result
    }

    /// Stores a finished fetch unless it was detached or already settled.
    fn settle(&self, key: &QueryKey, fetch_id: u64, result: &FetchResult) {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if !matches!(&entry.pending, Some(p) if p.id == fetch_id) {
            return;
        }
        entry.pending = None;
        match result {
            Ok(value) => {
                entry.value = Some(value.clone());
                entry.stale = false;
                entry.error = None;
            }
            Err(err) => {
                warn!(%key, error = %err, "fetch failed");
                entry.stale = true;
                entry.error = Some(err.clone());
            }
        }
    }

    /// Re-fetches `key` even if the cached value is fresh.
    pub async fn refetch(&self, key: &QueryKey) -> FetchResult {
        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(key) {
                entry.stale = true;
            }
        }
        self.read(key).await
    }

    pub fn peek(&self, key: &QueryKey) -> Option<Arc<QueryData>> {
        self.inner
            .entries
            .lock()
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    pub fn status(&self, key: &QueryKey) -> QueryStatus {
        let entries = self.inner.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.pending.is_some() => QueryStatus::Loading,
            Some(Entry {
                error: Some(err), ..
            }) => QueryStatus::Failed(err.clone()),
            Some(Entry { value: Some(_), .. }) => QueryStatus::Ready,
            _ => QueryStatus::Idle,
        }
    }

    /// Marks `key` stale so the next read re-fetches, and wakes its live watchers.
    ///
    /// A fetch already in flight is detached rather than awaited: its current
    /// waiters still get its result, it is never stored, and the next read
    /// starts a new fetch. Until the detached one finishes, two requests for
    /// the key can be on the wire; only the newer one can settle the entry.
    pub fn invalidate(&self, key: &QueryKey) {
        {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.stale = true;
            entry.pending = None;
        }
        debug!(%key, "invalidated");
        let _ = self.inner.invalidations.send(key.clone());
    }

    pub fn invalidate_where(&self, pred: impl Fn(&QueryKey) -> bool) {
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .lock()
            .keys()
            .filter(|k| pred(*k))
            .cloned()
            .collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Keeps `key` fresh in the background until the returned handle is dropped.
    pub fn watch(&self, key: QueryKey) -> LiveQuery {
        let (tx, rx) = watch::channel(QueryState::Loading);
        let task = tokio::spawn(run_live(self.clone(), key.clone(), tx));
        LiveQuery {
            key,
            updates: rx,
            task,
        }
    }

    pub async fn votes(&self, post_id: PostId) -> Result<Vec<Vote>> {
        let key = QueryKey::Votes(post_id);
        match &*self.read(&key).await? {
            QueryData::Votes(votes) => Ok(votes.clone()),
            _ => Err(unexpected(&key)),
        }
    }

    pub async fn posts(&self, community: Option<CommunityId>) -> Result<Vec<Post>> {
        let key = match community {
            Some(id) => QueryKey::CommunityPosts(id),
            None => QueryKey::Posts,
        };
        match &*self.read(&key).await? {
            QueryData::Posts(posts) => Ok(posts.clone()),
            _ => Err(unexpected(&key)),
        }
    }

    pub async fn post(&self, post_id: PostId) -> Result<Post> {
        let key = QueryKey::Post(post_id);
        match &*self.read(&key).await? {
            QueryData::Post(post) => Ok(post.clone()),
            _ => Err(unexpected(&key)),
        }
    }

    pub async fn communities(&self) -> Result<Vec<Community>> {
        let key = QueryKey::Communities;
        match &*self.read(&key).await? {
            QueryData::Communities(rows) => Ok(rows.clone()),
            _ => Err(unexpected(&key)),
        }
    }

    pub async fn comments(&self, post_id: PostId) -> Result<Vec<Comment>> {
        let key = QueryKey::Comments(post_id);
        match &*self.read(&key).await? {
            QueryData::Comments(rows) => Ok(rows.clone()),
            _ => Err(unexpected(&key)),
        }
    }
}

/// One reader awaiting a key's pending fetch.
///
/// Dropping the last waiter before the fetch settles (a cancelled read, an
/// aborted live query) drops the fetch itself, so the key falls back to its
/// previous status and the next read starts over.
struct Waiter<'a> {
    cache: &'a QueryCache,
    key: &'a QueryKey,
    fetch_id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut entries = self.cache.inner.entries.lock();
        let Some(entry) = entries.get_mut(self.key) else {
            return;
        };
        let Some(pending) = entry.pending.as_mut().filter(|p| p.id == self.fetch_id) else {
            return;
        };
        pending.waiters -= 1;
        if pending.waiters > 0 {
            return;
        }
        debug!(key = %self.key, "fetch abandoned by its last reader");
        entry.pending = None;
        if entry.is_empty() {
            entries.remove(self.key);
        }
    }
}

/// A key kept fresh by a background task. Dropping it cancels the task and
/// whatever fetch it was waiting on.
pub struct LiveQuery {
    key: QueryKey,
    updates: watch::Receiver<QueryState>,
    task: JoinHandle<()>,
}

impl LiveQuery {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn current(&self) -> QueryState {
        self.updates.borrow().clone()
    }

    /// Waits for the next state; `None` once the refresh task has stopped.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_live(cache: QueryCache, key: QueryKey, tx: watch::Sender<QueryState>) {
    let mut invalidated = cache.inner.invalidations.subscribe();
    let mut interval = match cache.refresh_policy(&key) {
        RefreshPolicy::Every(period) => {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        }
        RefreshPolicy::OnInvalidate => None,
    };

    let mut passive = false;
    loop {
        let result = if passive {
            cache.refetch(&key).await
        } else {
            cache.read(&key).await
        };
        let state = match result {
            Ok(data) => QueryState::Ready(data),
            Err(err) => QueryState::Failed(err),
        };
        if tx.send(state).is_err() {
            return;
        }

        passive = loop {
            tokio::select! {
                _ = tick(&mut interval) => break true,
                msg = invalidated.recv() => match msg {
                    Ok(k) if k == key => break false,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break false,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        };
        trace!(%key, passive, "live refresh");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use hivepost_shared::{User, VoteValue};

    fn setup(latency: Option<Duration>) -> (Arc<MemoryGateway>, QueryCache, PostId) {
        let mut gateway = MemoryGateway::new();
        if let Some(latency) = latency {
            gateway = gateway.with_latency(latency);
        }
        let gateway = Arc::new(gateway);
        gateway.set_session(Some(User {
            id: "u1".into(),
            username: "alice".into(),
            avatar_url: String::new(),
        }));
        let post_id = gateway.seed_post("hello", None);
        let cache = QueryCache::new(gateway.clone(), Duration::from_secs(5));
        (gateway, cache, post_id)
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let (gateway, cache, post_id) = setup(None);
        assert_eq!(cache.status(&QueryKey::Votes(post_id)), QueryStatus::Idle);

        cache.votes(post_id).await.unwrap();
        cache.votes(post_id).await.unwrap();
        assert_eq!(gateway.calls("list_votes"), 1);
        assert_eq!(cache.status(&QueryKey::Votes(post_id)), QueryStatus::Ready);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_fetch() {
        let (gateway, cache, post_id) = setup(Some(Duration::from_millis(20)));

        let (a, b, c) = tokio::join!(
            cache.votes(post_id),
            cache.votes(post_id),
            cache.votes(post_id)
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(gateway.calls("list_votes"), 1);
    }

    #[tokio::test]
    async fn invalidation_forces_refetch() {
        let (gateway, cache, post_id) = setup(None);
        assert!(cache.votes(post_id).await.unwrap().is_empty());

        gateway.seed_vote(post_id, "u2", VoteValue::Up);
        assert!(cache.votes(post_id).await.unwrap().is_empty());

        cache.invalidate(&QueryKey::Votes(post_id));
        assert_eq!(cache.votes(post_id).await.unwrap().len(), 1);
        assert_eq!(gateway.calls("list_votes"), 2);
    }

    #[tokio::test]
    async fn invalidation_detaches_in_flight_fetch() {
        let (gateway, cache, post_id) = setup(Some(Duration::from_millis(30)));

        let early = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.votes(post_id).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        // A write lands while the first fetch is still on the wire.
        gateway.seed_vote(post_id, "u2", VoteValue::Down);
        cache.invalidate(&QueryKey::Votes(post_id));

        // The next read must not join the fetch that started before the write.
        let late = cache.votes(post_id).await.unwrap();
        assert_eq!(late.len(), 1);
        assert!(early.await.unwrap().is_ok());
        assert_eq!(gateway.calls("list_votes"), 2);

        cache.votes(post_id).await.unwrap();
        assert_eq!(gateway.calls("list_votes"), 2);
    }

    #[tokio::test]
    async fn dropping_live_query_mid_fetch_abandons_the_fetch() {
        let (gateway, cache, post_id) = setup(Some(Duration::from_millis(50)));
        let key = QueryKey::Votes(post_id);

        let live = cache.watch(key.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.status(&key), QueryStatus::Loading);

        drop(live);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.status(&key), QueryStatus::Idle);
        assert_eq!(gateway.calls("list_votes"), 0);

        // A later read starts over instead of resuming the abandoned request.
        gateway.seed_vote(post_id, "u2", VoteValue::Up);
        assert_eq!(cache.votes(post_id).await.unwrap().len(), 1);
        assert_eq!(cache.status(&key), QueryStatus::Ready);
        assert_eq!(gateway.calls("list_votes"), 1);
    }

    #[tokio::test]
    async fn cancelled_reader_leaves_shared_fetch_to_the_others() {
        let (gateway, cache, post_id) = setup(Some(Duration::from_millis(30)));

        let impatient = tokio::time::timeout(Duration::from_millis(5), cache.votes(post_id));
        let (cancelled, patient) = tokio::join!(impatient, cache.votes(post_id));

        assert!(cancelled.is_err());
        assert!(patient.unwrap().is_empty());
        assert_eq!(gateway.calls("list_votes"), 1);
        assert_eq!(cache.status(&QueryKey::Votes(post_id)), QueryStatus::Ready);
    }

    #[tokio::test]
    async fn failures_surface_and_next_read_retries() {
        let (gateway, cache, post_id) = setup(None);
        gateway.fail_next("list_votes", SyncError::RemoteFailure("boom".into()));

        let err = cache.votes(post_id).await.unwrap_err();
        assert_eq!(err, SyncError::RemoteFailure("boom".into()));
        assert_eq!(cache.status(&QueryKey::Votes(post_id)), QueryStatus::Failed(err));

        assert!(cache.votes(post_id).await.is_ok());
        assert_eq!(cache.status(&QueryKey::Votes(post_id)), QueryStatus::Ready);
        assert_eq!(gateway.calls("list_votes"), 2);
    }

    #[tokio::test]
    async fn invalidate_where_touches_only_matching_keys() {
        let (gateway, cache, _) = setup(None);
        cache.posts(None).await.unwrap();
        cache.communities().await.unwrap();

        cache.invalidate_where(QueryKey::shows_post_counts);
        cache.posts(None).await.unwrap();
        cache.communities().await.unwrap();

        assert_eq!(gateway.calls("list_posts"), 2);
        assert_eq!(gateway.calls("list_communities"), 1);
    }

    #[test]
    fn only_vote_keys_poll() {
        let cache = QueryCache::new(Arc::new(MemoryGateway::new()), Duration::from_secs(5));
        assert_eq!(
            cache.refresh_policy(&QueryKey::Votes(1)),
            RefreshPolicy::Every(Duration::from_secs(5))
        );
        assert_eq!(cache.refresh_policy(&QueryKey::Posts), RefreshPolicy::OnInvalidate);
    }

    #[tokio::test]
    async fn live_query_follows_invalidation_and_stops_on_drop() {
        let (gateway, cache, post_id) = setup(None);
        let mut live = cache.watch(QueryKey::Votes(post_id));

        match live.changed().await {
            Some(QueryState::Ready(data)) => assert_eq!(*data, QueryData::Votes(vec![])),
            other => panic!("unexpected state {other:?}"),
        }

        gateway.seed_vote(post_id, "u2", VoteValue::Up);
        cache.invalidate(&QueryKey::Votes(post_id));
        match live.changed().await {
            Some(QueryState::Ready(data)) => match &*data {
                QueryData::Votes(votes) => assert_eq!(votes.len(), 1),
                other => panic!("unexpected data {other:?}"),
            },
            other => panic!("unexpected state {other:?}"),
        }

        let calls = gateway.calls("list_votes");
        drop(live);
        cache.invalidate(&QueryKey::Votes(post_id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gateway.calls("list_votes"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn live_votes_poll_on_interval() {
        let (gateway, cache, post_id) = setup(None);
        let mut live = cache.watch(QueryKey::Votes(post_id));
        live.changed().await;
        assert_eq!(gateway.calls("list_votes"), 1);

        // No invalidation: the interval alone drives the next fetch.
        gateway.seed_vote(post_id, "u2", VoteValue::Up);
        tokio::time::advance(Duration::from_secs(5)).await;
        match live.changed().await {
            Some(QueryState::Ready(data)) => match &*data {
                QueryData::Votes(votes) => assert_eq!(votes.len(), 1),
                other => panic!("unexpected data {other:?}"),
            },
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(gateway.calls("list_votes"), 2);
    }
}
