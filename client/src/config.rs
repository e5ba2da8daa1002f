use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// How often live keys (vote tallies) are re-fetched when nothing invalidates them.
pub const DEFAULT_LIVE_REFRESH: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub token_file: PathBuf,
    pub live_refresh: Duration,
    pub http_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            token_file: PathBuf::from(".hivepost-token"),
            live_refresh: DEFAULT_LIVE_REFRESH,
            http_timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();

        let refresh_secs: u64 = try_load("HIVEPOST_VOTE_REFRESH_SECS", defaults.live_refresh.as_secs())?;
        if refresh_secs == 0 {
            return Err(SyncError::Invalid(
                "HIVEPOST_VOTE_REFRESH_SECS must be at least 1".into(),
            ));
        }
        let timeout_secs: u64 = try_load("HIVEPOST_HTTP_TIMEOUT_SECS", 0)?;

        Ok(Self {
            api_url: try_load("HIVEPOST_API_URL", defaults.api_url)?,
            token_file: try_load("HIVEPOST_TOKEN_FILE", defaults.token_file.display())?,
            live_refresh: Duration::from_secs(refresh_secs),
            // Zero keeps the transport's own default.
            http_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        })
    }
}

fn try_load<T: FromStr>(key: &str, default: impl Display) -> Result<T>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        debug!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        SyncError::Invalid(format!("{key}: {e}"))
    })
}
