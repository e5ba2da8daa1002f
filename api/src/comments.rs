use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use hivepost_shared::{Comment, NewComment, PostId};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;

use crate::{
    auth,
    db::with_conn,
    error::{ApiError, Result},
    posts, AppState,
};

#[derive(Deserialize)]
pub struct ListParams {
    post_id: PostId,
}

const COMMENT_SELECT: &str = "
    SELECT c.id, c.post_id, c.parent_comment_id, c.content, c.user_id, u.username, c.created_at
    FROM comments c
    JOIN users u ON c.user_id = u.id";

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        post_id: row.get(1)?,
        parent_comment_id: row.get(2)?,
        content: row.get(3)?,
        user_id: row.get(4)?,
        author: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn list(conn: &Connection, post_id: PostId) -> Result<Vec<Comment>> {
    let mut stmt = conn.prepare(&format!(
        "{COMMENT_SELECT} WHERE c.post_id = ?1 ORDER BY c.created_at ASC, c.id ASC"
    ))?;
    let rows = stmt
        .query_map([post_id], comment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn insert(conn: &Connection, user_id: &str, new: &NewComment) -> Result<Comment> {
    let content = ammonia::clean(&new.content);
    if content.trim().is_empty() {
        return Err(ApiError::BadRequest("comment content is required".into()));
    }

    posts::ensure_exists(conn, new.post_id)?;

    if let Some(parent_id) = new.parent_comment_id {
        // A reply must hang off a comment on the same post.
        let parent_post: Option<PostId> = conn
            .query_row(
                "SELECT post_id FROM comments WHERE id = ?1",
                [parent_id],
                |row| row.get(0),
            )
            .optional()?;
        match parent_post {
            None => return Err(ApiError::NotFound(format!("comment {parent_id}"))),
            Some(p) if p != new.post_id => {
                return Err(ApiError::BadRequest(
                    "parent comment belongs to another post".into(),
                ))
            }
            Some(_) => {}
        }
    }

    conn.execute(
        "INSERT INTO comments (post_id, parent_comment_id, user_id, content) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![new.post_id, new.parent_comment_id, user_id, content],
    )?;

    let comment = conn.query_row(
        &format!("{COMMENT_SELECT} WHERE c.id = ?1"),
        [conn.last_insert_rowid()],
        comment_from_row,
    )?;
    Ok(comment)
}

/// GET /api/comments?post_id=...
pub async fn list_comments(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Comment>>> {
    let comments = with_conn(&state.db, move |conn| list(conn, params.post_id)).await?;
    Ok(Json(comments))
}

/// POST /api/comments
pub async fn create_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewComment>,
) -> Result<Json<Comment>> {
    let user_id = auth::extract_user_id(&headers, &state.config.jwt_secret)?;
    let comment = with_conn(&state.db, move |conn| insert(conn, &user_id, &payload)).await?;
    Ok(Json(comment))
}
