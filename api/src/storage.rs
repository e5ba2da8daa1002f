use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use hivepost_shared::{ImageUploaded, POST_IMAGES_BUCKET};
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::{
    auth,
    db::with_conn,
    error::{ApiError, Result},
    AppState,
};

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(ApiError::BadRequest(format!("invalid object path: {path}")));
    }
    Ok(())
}

/// `path` arrives decoded from the route; each segment is re-encoded for the URL.
pub fn public_url(api_url: &str, path: &str) -> String {
    let encoded = path
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{api_url}/api/storage/{POST_IMAGES_BUCKET}/{encoded}")
}

pub fn put_object(conn: &Connection, path: &str, content_type: &str, bytes: &[u8]) -> Result<()> {
    validate_path(path)?;
    conn.execute(
        "INSERT INTO objects (bucket, path, content_type, bytes) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![POST_IMAGES_BUCKET, path, content_type, bytes],
    )
    .map_err(|e| ApiError::from_insert(e, "object at this path"))?;
    Ok(())
}

pub fn get_object(conn: &Connection, path: &str) -> Result<(String, Vec<u8>)> {
    conn.query_row(
        "SELECT content_type, bytes FROM objects WHERE bucket = ?1 AND path = ?2",
        rusqlite::params![POST_IMAGES_BUCKET, path],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| ApiError::NotFound(format!("object {path}")))
}

/// PUT /api/storage/post-images/*path
pub async fn upload_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<Json<ImageUploaded>> {
    auth::extract_user_id(&headers, &state.config.jwt_secret)?;

    if body.is_empty() || body.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::BadRequest(format!(
            "image must be between 1 and {MAX_IMAGE_BYTES} bytes"
        )));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let stored_path = path.clone();
    with_conn(&state.db, move |conn| {
        put_object(conn, &stored_path, &content_type, &body)
    })
    .await?;
    info!(%path, "image uploaded");

    Ok(Json(ImageUploaded {
        public_url: public_url(&state.config.api_url, &path),
    }))
}

/// GET /api/storage/post-images/*path
pub async fn download_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse> {
    let (content_type, bytes) = with_conn(&state.db, move |conn| get_object(conn, &path)).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    #[test]
    fn stores_and_serves_objects() {
        let conn = test_conn();
        put_object(&conn, "cat-1-cat.png", "image/png", b"png").unwrap();
        let (ct, bytes) = get_object(&conn, "cat-1-cat.png").unwrap();
        assert_eq!(ct, "image/png");
        assert_eq!(bytes, b"png");

        assert!(matches!(
            put_object(&conn, "cat-1-cat.png", "image/png", b"again"),
            Err(ApiError::Conflict(_))
        ));
    }

    #[test]
    fn rejects_traversal_paths() {
        let conn = test_conn();
        assert!(put_object(&conn, "../etc/passwd", "text/plain", b"x").is_err());
        assert!(put_object(&conn, "", "text/plain", b"x").is_err());
        assert!(matches!(get_object(&conn, "nope"), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn public_url_points_at_bucket() {
        assert_eq!(
            public_url("http://localhost:8080", "a.png"),
            "http://localhost:8080/api/storage/post-images/a.png"
        );
        assert_eq!(
            public_url("http://localhost:8080", "dir/a b#1?.png"),
            "http://localhost:8080/api/storage/post-images/dir/a%20b%231%3F.png"
        );
    }
}
