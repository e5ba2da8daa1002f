use axum::{extract::State, http::HeaderMap, Json};
use hivepost_shared::{Community, CommunityId, NewCommunity};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::info;

use crate::{
    auth,
    db::with_conn,
    error::{ApiError, Result},
    AppState,
};

fn community_from_row(row: &Row<'_>) -> rusqlite::Result<Community> {
    Ok(Community {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub fn list(conn: &Connection) -> Result<Vec<Community>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, created_at FROM communities
         ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([], community_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn ensure_exists(conn: &Connection, id: CommunityId) -> Result<()> {
    conn.query_row("SELECT id FROM communities WHERE id = ?1", [id], |row| {
        row.get::<_, i64>(0)
    })
    .optional()?
    .map(|_| ())
    .ok_or_else(|| ApiError::NotFound(format!("community {id}")))
}

pub fn insert(conn: &Connection, new: &NewCommunity) -> Result<Community> {
    let name = ammonia::clean(new.name.trim());
    let description = ammonia::clean(&new.description);

    if name.is_empty() {
        return Err(ApiError::BadRequest("community name is required".into()));
    }

    conn.execute(
        "INSERT INTO communities (name, description) VALUES (?1, ?2)",
        rusqlite::params![name, description],
    )
    .map_err(|e| ApiError::from_insert(e, "community with this name"))?;

    let row = conn.query_row(
        "SELECT id, name, description, created_at FROM communities WHERE id = ?1",
        [conn.last_insert_rowid()],
        community_from_row,
    )?;
    Ok(row)
}

// ── Handlers ──

/// GET /api/communities
pub async fn list_communities(State(state): State<AppState>) -> Result<Json<Vec<Community>>> {
    let rows = with_conn(&state.db, list).await?;
    Ok(Json(rows))
}

/// POST /api/communities
pub async fn create_community(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewCommunity>,
) -> Result<Json<Community>> {
    auth::extract_user_id(&headers, &state.config.jwt_secret)?;
    let community = with_conn(&state.db, move |conn| insert(conn, &payload)).await?;
    info!(community_id = community.id, name = %community.name, "community created");
    Ok(Json(community))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn new(name: &str) -> NewCommunity {
        NewCommunity {
            name: name.into(),
            description: String::new(),
        }
    }

    #[test]
    fn names_are_unique() {
        let conn = test_conn();
        insert(&conn, &new("rust")).unwrap();
        assert!(matches!(insert(&conn, &new("rust")), Err(ApiError::Conflict(_))));
        assert!(matches!(insert(&conn, &new("   ")), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn list_returns_newest_first() {
        let conn = test_conn();
        insert(&conn, &new("a")).unwrap();
        insert(&conn, &new("b")).unwrap();
        let names: Vec<_> = list(&conn).unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
