use std::{io, path::PathBuf};

use async_trait::async_trait;
use hivepost_shared::{
    Comment, Community, CommunityId, CreateVote, ErrorBody, ImageUploaded, NewComment,
    NewCommunity, NewPost, Post, PostId, UpdateVote, User, Vote, VoteId, VoteValue,
    POST_IMAGES_BUCKET,
};
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::broadcast};
use tracing::{debug, info, warn};

use super::{RemoteGateway, SessionEvent};
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};

/// Session token persisted between runs, readable by the owner only.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read once when the gateway is built, before any request is made.
    pub fn load(&self) -> Option<String> {
        let token = std::fs::read_to_string(&self.path).ok()?;
        let token = token.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    fn failure(&self, err: io::Error) -> SyncError {
        SyncError::Invalid(format!("token file {}: {err}", self.path.display()))
    }

    pub async fn save(&self, token: &str) -> Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await.map_err(|e| self.failure(e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // `mode` only applies when the file is created.
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| self.failure(e))?;
        }
        file.write_all(token.as_bytes())
            .await
            .map_err(|e| self.failure(e))?;
        file.flush().await.map_err(|e| self.failure(e))?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(self.failure(e)),
            _ => Ok(()),
        }
    }
}

/// Talks to the platform's REST surface with a bearer token.
pub struct HttpGateway {
    client: reqwest::Client,
    base: String,
    token: RwLock<Option<String>>,
    store: Option<TokenStore>,
    sessions: broadcast::Sender<SessionEvent>,
}

impl HttpGateway {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent("hivepost-client");
        if let Some(timeout) = config.http_timeout {
            builder = builder.timeout(timeout);
        }
        let store = TokenStore::new(&config.token_file);
        let token = store.load();

        Ok(Self {
            client: builder.build()?,
            base: config.api_url.trim_end_matches('/').to_string(),
            token: RwLock::new(token),
            store: Some(store),
            sessions: broadcast::channel(16).0,
        })
    }

    /// A gateway that keeps its token in memory only.
    pub fn with_base_url(base: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent("hivepost-client")
                .build()?,
            base: base.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            store: None,
            sessions: broadcast::channel(16).0,
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, self.url(path));
        match self.token.read().as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = check(self.request(Method::GET, path).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = check(self.request(method, path).json(body).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        check(self.request(Method::DELETE, path).send().await?).await?;
        Ok(())
    }

    async fn forget_token(&self) {
        *self.token.write() = None;
        if let Some(store) = &self.store {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "failed to clear stored session token");
            }
        }
    }
}

/// Turns a non-success response into the matching [`SyncError`].
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error.message)
        .unwrap_or_else(|_| format!("API error: {status}"));

    Err(match status {
        StatusCode::UNAUTHORIZED => SyncError::Unauthenticated,
        StatusCode::NOT_FOUND => SyncError::NotFound(message.trim_end_matches(" not found").to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SyncError::Invalid(message),
        _ => SyncError::RemoteFailure(message),
    })
}

fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn insert_vote(&self, post_id: PostId, user_id: &str, value: VoteValue) -> Result<Vote> {
        let payload = CreateVote {
            post_id,
            user_id: user_id.to_string(),
            value,
        };
        self.send_json(Method::POST, "/api/votes", &payload).await
    }

    async fn update_vote(&self, vote_id: VoteId, value: VoteValue) -> Result<Vote> {
        self.send_json(Method::PATCH, &format!("/api/votes/{vote_id}"), &UpdateVote { value })
            .await
    }

    async fn delete_vote(&self, vote_id: VoteId) -> Result<()> {
        self.delete(&format!("/api/votes/{vote_id}")).await
    }

    async fn list_votes(&self, post_id: PostId) -> Result<Vec<Vote>> {
        self.get(&format!("/api/votes?post_id={post_id}")).await
    }

    async fn list_posts(&self, community: Option<CommunityId>) -> Result<Vec<Post>> {
        match community {
            Some(id) => self.get(&format!("/api/posts?community_id={id}")).await,
            None => self.get("/api/posts").await,
        }
    }

    async fn get_post(&self, post_id: PostId) -> Result<Post> {
        self.get(&format!("/api/posts/{post_id}")).await
    }

    async fn insert_post(&self, post: NewPost) -> Result<Post> {
        self.send_json(Method::POST, "/api/posts", &post).await
    }

    async fn list_communities(&self) -> Result<Vec<Community>> {
        self.get("/api/communities").await
    }

    async fn insert_community(&self, community: NewCommunity) -> Result<Community> {
        self.send_json(Method::POST, "/api/communities", &community).await
    }

    async fn list_comments(&self, post_id: PostId) -> Result<Vec<Comment>> {
        self.get(&format!("/api/comments?post_id={post_id}")).await
    }

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment> {
        self.send_json(Method::POST, "/api/comments", &comment).await
    }

    async fn upload_image(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        let encoded = path
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let req = self
            .request(
                Method::PUT,
                &format!("/api/storage/{POST_IMAGES_BUCKET}/{encoded}"),
            )
            .header(reqwest::header::CONTENT_TYPE, content_type_for(path))
            .body(bytes);

        let uploaded: ImageUploaded = check(req.send().await?).await?.json().await?;
        debug!(%path, url = %uploaded.public_url, "image uploaded");
        Ok(uploaded.public_url)
    }

    async fn current_user(&self) -> Result<Option<User>> {
        if !self.has_token() {
            return Ok(None);
        }
        match self.get::<User>("/api/auth/me").await {
            Ok(user) => Ok(Some(user)),
            Err(SyncError::Unauthenticated) => {
                // Token invalid or expired, clear it
                info!("stored session was rejected, signing out");
                self.forget_token().await;
                let _ = self.sessions.send(SessionEvent::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in(&self, token: &str) -> Result<User> {
        let previous = self.token.write().replace(token.to_string());

        let user = match self.get::<User>("/api/auth/me").await {
            Ok(user) => user,
            Err(e) => {
                *self.token.write() = previous;
                return Err(e);
            }
        };

        if let Some(store) = &self.store {
            store.save(token).await?;
        }
        info!(user = %user.username, "signed in");
        let _ = self.sessions.send(SessionEvent::SignedIn(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        self.forget_token().await;
        let _ = self.sessions.send(SessionEvent::SignedOut);
        Ok(())
    }

    fn sign_in_url(&self, redirect: &str) -> String {
        format!(
            "{}/api/auth/github?redirect={}",
            self.base,
            urlencoding::encode(redirect)
        )
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_store_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token"));
        assert_eq!(store.load(), None);

        store.save("abc\n").await.unwrap();
        assert_eq!(store.load().as_deref(), Some("abc"));

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_token_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        TokenStore::new(&path).save("secret").await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret");
    }

    #[tokio::test]
    async fn unwritable_token_file_is_a_local_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("missing").join("token"));
        assert!(matches!(store.save("t").await, Err(SyncError::Invalid(_))));
    }

    #[test]
    fn guesses_image_content_types() {
        assert_eq!(content_type_for("a-1-cat.PNG"), "image/png");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn sign_in_url_encodes_redirect() {
        let gateway = HttpGateway::with_base_url("http://api.test/").unwrap();
        assert_eq!(
            gateway.sign_in_url("http://app.test/?x=1"),
            "http://api.test/api/auth/github?redirect=http%3A%2F%2Fapp.test%2F%3Fx%3D1"
        );
    }
}
