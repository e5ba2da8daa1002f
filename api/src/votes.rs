use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hivepost_shared::{CreateVote, PostId, UpdateVote, Vote, VoteId, VoteValue};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;
use tracing::debug;

use crate::{
    auth,
    db::with_conn,
    error::{ApiError, Result},
    posts, AppState,
};

#[derive(Deserialize)]
pub struct VoteQuery {
    post_id: PostId,
}

fn vote_from_row(row: &Row<'_>) -> rusqlite::Result<Vote> {
    let raw: i32 = row.get(3)?;
    let value = VoteValue::try_from(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Integer, Box::new(e))
    })?;
    Ok(Vote {
        id: row.get(0)?,
        post_id: row.get(1)?,
        user_id: row.get(2)?,
        value,
    })
}

pub fn list_for_post(conn: &Connection, post_id: PostId) -> Result<Vec<Vote>> {
    let mut stmt = conn.prepare(
        "SELECT id, post_id, user_id, value FROM votes WHERE post_id = ?1 ORDER BY id",
    )?;
    let votes = stmt
        .query_map([post_id], vote_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(votes)
}

fn find(conn: &Connection, vote_id: VoteId) -> Result<Vote> {
    conn.query_row(
        "SELECT id, post_id, user_id, value FROM votes WHERE id = ?1",
        [vote_id],
        vote_from_row,
    )
    .optional()?
    .ok_or_else(|| ApiError::NotFound(format!("vote {vote_id}")))
}

pub fn insert(conn: &Connection, post_id: PostId, user_id: &str, value: VoteValue) -> Result<Vote> {
    posts::ensure_exists(conn, post_id)?;
    conn.execute(
        "INSERT INTO votes (post_id, user_id, value) VALUES (?1, ?2, ?3)",
        rusqlite::params![post_id, user_id, value.as_i32()],
    )
    .map_err(|e| ApiError::from_insert(e, "vote for this post"))?;
    find(conn, conn.last_insert_rowid())
}

/// Only the vote's owner may change it; anything else reads as "not found".
pub fn update(conn: &Connection, vote_id: VoteId, user_id: &str, value: VoteValue) -> Result<Vote> {
    let affected = conn.execute(
        "UPDATE votes SET value = ?3 WHERE id = ?1 AND user_id = ?2",
        rusqlite::params![vote_id, user_id, value.as_i32()],
    )?;
    if affected == 0 {
        return Err(ApiError::NotFound(format!("vote {vote_id}")));
    }
    find(conn, vote_id)
}

pub fn delete(conn: &Connection, vote_id: VoteId, user_id: &str) -> Result<()> {
    let affected = conn.execute(
        "DELETE FROM votes WHERE id = ?1 AND user_id = ?2",
        rusqlite::params![vote_id, user_id],
    )?;
    if affected == 0 {
        return Err(ApiError::NotFound(format!("vote {vote_id}")));
    }
    Ok(())
}

// ── Handlers ──

/// GET /api/votes?post_id=42
pub async fn list_votes(
    State(state): State<AppState>,
    Query(params): Query<VoteQuery>,
) -> Result<Json<Vec<Vote>>> {
    let votes = with_conn(&state.db, move |conn| list_for_post(conn, params.post_id)).await?;
    Ok(Json(votes))
}

/// POST /api/votes
pub async fn create_vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateVote>,
) -> Result<Json<Vote>> {
    let user_id = auth::extract_user_id(&headers, &state.config.jwt_secret)?;
    if payload.user_id != user_id {
        return Err(ApiError::Forbidden);
    }

    let vote = with_conn(&state.db, move |conn| {
        insert(conn, payload.post_id, &user_id, payload.value)
    })
    .await?;
    debug!(vote_id = vote.id, post_id = vote.post_id, value = %vote.value, "vote inserted");

    Ok(Json(vote))
}

/// PATCH /api/votes/:id
pub async fn update_vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<VoteId>,
    Json(payload): Json<UpdateVote>,
) -> Result<Json<Vote>> {
    let user_id = auth::extract_user_id(&headers, &state.config.jwt_secret)?;
    let vote = with_conn(&state.db, move |conn| update(conn, id, &user_id, payload.value)).await?;
    debug!(vote_id = vote.id, value = %vote.value, "vote updated");
    Ok(Json(vote))
}

/// DELETE /api/votes/:id
pub async fn delete_vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<VoteId>,
) -> Result<StatusCode> {
    let user_id = auth::extract_user_id(&headers, &state.config.jwt_secret)?;
    with_conn(&state.db, move |conn| delete(conn, id, &user_id)).await?;
    debug!(vote_id = id, "vote deleted");
    Ok(StatusCode::NO_CONTENT)
}
