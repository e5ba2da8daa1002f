use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use hivepost_shared::{CommunityId, NewPost, Post, PostId};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;
use tracing::info;

use crate::{
    auth, communities,
    db::with_conn,
    error::{ApiError, Result},
    AppState,
};

// ── Query params ──

#[derive(Deserialize)]
pub struct PostListParams {
    community_id: Option<CommunityId>,
}

// Posts with their derived counts; likes are the +1 votes only.
const POST_SELECT: &str = "
    SELECT p.id, p.title, p.content, p.image_url, p.avatar_url, p.created_at,
           p.community_id, c.name,
           (SELECT COUNT(*) FROM votes v WHERE v.post_id = p.id AND v.value = 1),
           (SELECT COUNT(*) FROM comments m WHERE m.post_id = p.id)
    FROM posts p
    LEFT JOIN communities c ON c.id = p.community_id";

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        image_url: row.get(3)?,
        avatar_url: row.get(4)?,
        created_at: row.get(5)?,
        community_id: row.get(6)?,
        community_name: row.get(7)?,
        like_count: row.get(8)?,
        comment_count: row.get(9)?,
    })
}

pub fn list(conn: &Connection, community_id: Option<CommunityId>) -> Result<Vec<Post>> {
    let sql = format!(
        "{POST_SELECT}
         WHERE (?1 IS NULL OR p.community_id = ?1)
         ORDER BY p.created_at DESC, p.id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let posts = stmt
        .query_map([community_id], post_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(posts)
}

pub fn find(conn: &Connection, post_id: PostId) -> Result<Post> {
    conn.query_row(&format!("{POST_SELECT} WHERE p.id = ?1"), [post_id], post_from_row)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("post {post_id}")))
}

pub fn ensure_exists(conn: &Connection, post_id: PostId) -> Result<()> {
    conn.query_row("SELECT id FROM posts WHERE id = ?1", [post_id], |row| {
        row.get::<_, i64>(0)
    })
    .optional()?
    .map(|_| ())
    .ok_or_else(|| ApiError::NotFound(format!("post {post_id}")))
}

pub fn insert(conn: &Connection, user_id: &str, new: &NewPost) -> Result<Post> {
    let title = ammonia::clean(&new.title);
    let content = ammonia::clean(&new.content);

    if title.trim().is_empty() || content.trim().is_empty() {
        return Err(ApiError::BadRequest("title and content are required".into()));
    }
    if new.image_url.trim().is_empty() {
        return Err(ApiError::BadRequest("image_url is required".into()));
    }
    if let Some(community_id) = new.community_id {
        communities::ensure_exists(conn, community_id)?;
    }

    conn.execute(
        "INSERT INTO posts (title, content, image_url, avatar_url, community_id, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            title,
            content,
            new.image_url,
            new.avatar_url,
            new.community_id,
            user_id
        ],
    )?;

    find(conn, conn.last_insert_rowid())
}

// ── Handlers ──

/// GET /api/posts?community_id=3
pub async fn list_posts(
    State(state): State<AppState>,
    Query(params): Query<PostListParams>,
) -> Result<Json<Vec<Post>>> {
    let posts = with_conn(&state.db, move |conn| list(conn, params.community_id)).await?;
    Ok(Json(posts))
}

/// GET /api/posts/:id
pub async fn get_post(State(state): State<AppState>, Path(id): Path<PostId>) -> Result<Json<Post>> {
    let post = with_conn(&state.db, move |conn| find(conn, id)).await?;
    Ok(Json(post))
}

/// POST /api/posts
pub async fn create_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewPost>,
) -> Result<Json<Post>> {
    let user_id = auth::extract_user_id(&headers, &state.config.jwt_secret)?;
    let post = with_conn(&state.db, move |conn| insert(conn, &user_id, &payload)).await?;
    info!(post_id = post.id, "post created");
    Ok(Json(post))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{insert_test_user, test_conn};
    use crate::votes;
    use hivepost_shared::{NewCommunity, VoteValue};

    pub(crate) fn seed_post(conn: &Connection, user_id: &str, community_id: Option<i64>) -> PostId {
        let new = NewPost {
            title: "Hello".into(),
            content: "World".into(),
            image_url: "http://img/1.png".into(),
            avatar_url: None,
            community_id,
        };
        insert(conn, user_id, &new).unwrap().id
    }

    #[test]
    fn list_is_newest_first_with_counts() {
        let conn = test_conn();
        insert_test_user(&conn, "u1", "alice");
        insert_test_user(&conn, "u2", "bob");
        let first = seed_post(&conn, "u1", None);
        let second = seed_post(&conn, "u1", None);

        votes::insert(&conn, first, "u1", VoteValue::Up).unwrap();
        votes::insert(&conn, first, "u2", VoteValue::Down).unwrap();

        let posts = list(&conn, None).unwrap();
        assert_eq!(posts.iter().map(|p| p.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(posts[1].like_count, 1);
        assert_eq!(posts[1].comment_count, 0);
    }

    #[test]
    fn filter_by_community_joins_name() {
        let conn = test_conn();
        insert_test_user(&conn, "u1", "alice");
        let community = communities::insert(
            &conn,
            &NewCommunity {
                name: "rust".into(),
                description: "crabs".into(),
            },
        )
        .unwrap();
        let in_community = seed_post(&conn, "u1", Some(community.id));
        seed_post(&conn, "u1", None);

        let posts = list(&conn, Some(community.id)).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, in_community);
        assert_eq!(posts[0].community_name.as_deref(), Some("rust"));
    }

    #[test]
    fn rejects_blank_title_and_unknown_community() {
        let conn = test_conn();
        insert_test_user(&conn, "u1", "alice");
        let mut new = NewPost {
            title: "  ".into(),
            content: "body".into(),
            image_url: "http://img".into(),
            avatar_url: None,
            community_id: None,
        };
        assert!(matches!(insert(&conn, "u1", &new), Err(ApiError::BadRequest(_))));

        new.title = "ok".into();
        new.community_id = Some(99);
        assert!(matches!(insert(&conn, "u1", &new), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn missing_post_is_not_found() {
        let conn = test_conn();
        assert!(matches!(find(&conn, 5), Err(ApiError::NotFound(_))));
    }
}
