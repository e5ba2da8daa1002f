use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect},
    Json,
};
use hivepost_shared::User;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    db::with_conn,
    error::{ApiError, Result},
    AppState,
};

const SESSION_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;

// ── JWT Claims ──

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: usize,  // expiry (unix timestamp)
}

impl Claims {
    pub fn new(user_id: &str) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            sub: user_id.to_string(),
            exp: (now + SESSION_LIFETIME_SECS) as usize,
        }
    }
}

pub fn issue_token(user_id: &str, jwt_secret: &str) -> Result<String> {
    encode(
        &Header::default(),
        &Claims::new(user_id),
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(e.to_string()))
}

// ── Extract authenticated user from Authorization header ──

pub fn extract_user_id(headers: &HeaderMap, jwt_secret: &str) -> Result<String> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized)?;

    Ok(data.claims.sub)
}

// ── Users ──

pub fn upsert_github_user(
    conn: &Connection,
    github_id: i64,
    username: &str,
    avatar_url: &str,
) -> Result<String> {
    conn.execute(
        "INSERT INTO users (id, github_id, username, avatar_url)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(github_id) DO UPDATE SET username = ?3, avatar_url = ?4",
        rusqlite::params![uuid::Uuid::new_v4().to_string(), github_id, username, avatar_url],
    )?;

    let id = conn.query_row(
        "SELECT id FROM users WHERE github_id = ?1",
        [github_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn find_user(conn: &Connection, user_id: &str) -> Result<User> {
    conn.query_row(
        "SELECT id, username, avatar_url FROM users WHERE id = ?1",
        [user_id],
        |row| {
            Ok(User {
                id: row.get(0)?,
                username: row.get(1)?,
                avatar_url: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))
}

// ── GitHub OAuth types ──

#[derive(Deserialize)]
pub struct LoginParams {
    redirect: Option<String>,
}

#[derive(Deserialize)]
pub struct CallbackParams {
    code: String,
    state: Option<String>,
}

#[derive(Deserialize)]
struct GitHubTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GitHubUser {
    id: i64,
    login: String,
    avatar_url: String,
}

/// Where to send the browser after sign-in. Only the configured front-end
/// origin may receive a token; anything else falls back to it.
pub fn allowed_redirect(requested: Option<String>, origin: &str) -> String {
    let origin = origin.trim_end_matches('/');
    match requested {
        Some(url)
            if url == origin
                || url
                    .strip_prefix(origin)
                    .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?')) =>
        {
            url
        }
        Some(url) => {
            warn!(%url, "rejected sign-in redirect outside the front-end origin");
            origin.to_string()
        }
        None => origin.to_string(),
    }
}

// ── Handlers ──

/// GET /api/auth/github: redirect to GitHub OAuth
pub async fn github_login(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> impl IntoResponse {
    let redirect_after = allowed_redirect(params.redirect, &state.config.cors_origin);

    let url = format!(
        "https://github.com/login/oauth/authorize?client_id={}&redirect_uri={}/api/auth/callback&state={}",
        state.config.github_client_id,
        state.config.api_url,
        urlencoding::encode(&redirect_after),
    );

    Redirect::temporary(&url)
}

/// GET /api/auth/callback: exchange code, upsert user, redirect with JWT
pub async fn github_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse> {
    let upstream = |e: reqwest::Error| ApiError::Upstream(e.to_string());

    let client = reqwest::Client::new();
    let token_resp = client
        .post("https://github.com/login/oauth/access_token")
        .header("Accept", "application/json")
        .json(&serde_json::json!({
            "client_id": state.config.github_client_id,
            "client_secret": state.config.github_client_secret,
            "code": params.code,
        }))
        .send()
        .await
        .map_err(upstream)?
        .json::<GitHubTokenResponse>()
        .await
        .map_err(upstream)?;

    let gh_user = client
        .get("https://api.github.com/user")
        .header("Authorization", format!("Bearer {}", token_resp.access_token))
        .header("User-Agent", "hivepost-api")
        .send()
        .await
        .map_err(upstream)?
        .json::<GitHubUser>()
        .await
        .map_err(upstream)?;

    let user_id = with_conn(&state.db, move |conn| {
        upsert_github_user(conn, gh_user.id, &gh_user.login, &gh_user.avatar_url)
    })
    .await?;
    info!(%user_id, "user signed in through GitHub");

    let jwt = issue_token(&user_id, &state.config.jwt_secret)?;

    // `state` round-trips through GitHub, so it is checked again here.
    let redirect_to = allowed_redirect(params.state, &state.config.cors_origin);

    let separator = if redirect_to.contains('?') { "&" } else { "?" };
    let url = format!("{redirect_to}{separator}token={jwt}");

    Ok(Redirect::temporary(&url))
}

/// GET /api/auth/me: return current user
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<User>> {
    let user_id = extract_user_id(&headers, &state.config.jwt_secret)?;

    // A token for a user that no longer exists is as good as no token.
    let user = with_conn(&state.db, move |conn| find_user(conn, &user_id))
        .await
        .map_err(|e| match e {
            ApiError::NotFound(_) => ApiError::Unauthorized,
            other => other,
        })?;

    Ok(Json(user))
}
