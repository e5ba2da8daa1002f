mod auth;
mod comments;
mod communities;
mod config;
mod db;
mod error;
mod posts;
mod storage;
mod votes;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, put},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub type DbPool = r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
}

fn router(state: AppState) -> anyhow::Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(state.config.cors_origin.parse::<axum::http::HeaderValue>()?)
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any());

    let app = Router::new()
        .route("/api/health", get(|| async { "ok" }))
        // Auth
        .route("/api/auth/github", get(auth::github_login))
        .route("/api/auth/callback", get(auth::github_callback))
        .route("/api/auth/me", get(auth::me))
        // Votes
        .route("/api/votes", get(votes::list_votes).post(votes::create_vote))
        .route(
            "/api/votes/{id}",
            patch(votes::update_vote).delete(votes::delete_vote),
        )
        // Posts
        .route("/api/posts", get(posts::list_posts).post(posts::create_post))
        .route("/api/posts/{id}", get(posts::get_post))
        // Communities
        .route(
            "/api/communities",
            get(communities::list_communities).post(communities::create_community),
        )
        // Comments
        .route(
            "/api/comments",
            get(comments::list_comments).post(comments::create_comment),
        )
        // Object storage
        .route(
            "/api/storage/post-images/{*path}",
            put(storage::upload_image).get(storage::download_image),
        )
        .layer(DefaultBodyLimit::max(storage::MAX_IMAGE_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    Ok(app)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;

    let manager = r2d2_sqlite::SqliteConnectionManager::file(&config.database_url)
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = r2d2::Pool::new(manager)?;

    db::run_migrations(&pool)?;

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        db: pool,
        config: Arc::new(config),
    };
    let app = router(state)?;

    info!("API server listening on {bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn test_state() -> AppState {
        // One connection, so the in-memory database is shared across requests.
        let manager = r2d2_sqlite::SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager).unwrap();
        db::run_migrations(&pool).unwrap();

        AppState {
            db: pool,
            config: Arc::new(Config {
                database_url: ":memory:".into(),
                bind_addr: "127.0.0.1:0".into(),
                jwt_secret: "test-secret".into(),
                github_client_id: String::new(),
                github_client_secret: String::new(),
                api_url: "http://localhost:8080".into(),
                cors_origin: "http://localhost:5173".into(),
            }),
        }
    }

    #[tokio::test]
    async fn health_and_public_reads() {
        let app = router(test_state()).unwrap();

        let resp = app
            .clone()
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/api/posts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn writes_require_a_token() {
        let app = router(test_state()).unwrap();

        let resp = app
            .oneshot(
                Request::post("/api/votes")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"post_id":1,"user_id":"u1","value":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn voting_for_someone_else_is_forbidden() {
        let state = test_state();
        let token = auth::issue_token("u1", &state.config.jwt_secret).unwrap();
        let app = router(state).unwrap();

        let resp = app
            .oneshot(
                Request::post("/api/votes")
                    .header("Content-Type", "application/json")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::from(r#"{"post_id":1,"user_id":"u2","value":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn uploaded_image_url_round_trips_escaped_names() {
        let state = test_state();
        let token = auth::issue_token("u1", &state.config.jwt_secret).unwrap();
        let app = router(state).unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::put("/api/storage/post-images/cat-1-a%20b%231.png")
                    .header("Content-Type", "image/png")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::from(&b"png"[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let uploaded: hivepost_shared::ImageUploaded = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            uploaded.public_url,
            "http://localhost:8080/api/storage/post-images/cat-1-a%20b%231.png"
        );

        let path = uploaded.public_url.trim_start_matches("http://localhost:8080");
        let resp = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"png");
    }

    #[tokio::test]
    async fn sign_in_ignores_foreign_redirects() {
        let app = router(test_state()).unwrap();

        let resp = app
            .oneshot(
                Request::get("/api/auth/github?redirect=https%3A%2F%2Fevil.example%2F")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = resp.headers()["location"].to_str().unwrap();
        assert!(location.ends_with("&state=http%3A%2F%2Flocalhost%3A5173"));
        assert!(!location.contains("evil.example"));
    }
}
