use rusqlite::Connection;

use crate::{error::ApiError, DbPool};

pub fn run_migrations(pool: &DbPool) -> Result<(), ApiError> {
    let conn = pool.get()?;
    migrate(&conn)
}

pub fn migrate(conn: &Connection) -> Result<(), ApiError> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            github_id   INTEGER UNIQUE NOT NULL,
            username    TEXT NOT NULL,
            avatar_url  TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS communities (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT UNIQUE NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS posts (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            title        TEXT NOT NULL,
            content      TEXT NOT NULL,
            image_url    TEXT NOT NULL,
            avatar_url   TEXT,
            community_id INTEGER REFERENCES communities(id),
            user_id      TEXT NOT NULL REFERENCES users(id),
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_posts_community ON posts(community_id);

        CREATE TABLE IF NOT EXISTS votes (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id     INTEGER NOT NULL REFERENCES posts(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            value       INTEGER NOT NULL CHECK (value IN (1, -1)),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(post_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_votes_post ON votes(post_id);

        CREATE TABLE IF NOT EXISTS comments (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id           INTEGER NOT NULL REFERENCES posts(id),
            parent_comment_id INTEGER REFERENCES comments(id),
            user_id           TEXT NOT NULL REFERENCES users(id),
            content           TEXT NOT NULL,
            created_at        TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id);

        -- Object storage for uploaded images, keyed by bucket + path
        CREATE TABLE IF NOT EXISTS objects (
            bucket       TEXT NOT NULL,
            path         TEXT NOT NULL,
            content_type TEXT NOT NULL,
            bytes        BLOB NOT NULL,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (bucket, path)
        );
        ",
    )?;

    Ok(())
}

/// Runs `f` on a pooled connection off the async runtime.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, ApiError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
}

/// Seeds a user row directly; used by store-level tests.
#[cfg(test)]
pub fn insert_test_user(conn: &Connection, id: &str, username: &str) {
    conn.execute(
        "INSERT INTO users (id, github_id, username, avatar_url) VALUES (?1, abs(random()), ?2, '')",
        rusqlite::params![id, username],
    )
    .unwrap();
}

#[cfg(test)]
pub fn test_conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();
    conn
}
