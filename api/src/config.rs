use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub github_client_id: String,
    pub github_client_secret: String,
    pub api_url: String,
    pub cors_origin: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let jwt_secret = var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set, using the development secret");
            "dev-secret-change-me".to_string()
        });

        Ok(Self {
            database_url: try_load("DATABASE_URL", "hivepost.db")?,
            bind_addr: try_load("BIND_ADDR", "0.0.0.0:8080")?,
            jwt_secret,
            github_client_id: var("GITHUB_CLIENT_ID").unwrap_or_default(),
            github_client_secret: var("GITHUB_CLIENT_SECRET").unwrap_or_default(),
            api_url: try_load("API_URL", "http://localhost:8080")?,
            cors_origin: try_load("CORS_ORIGIN", "http://localhost:5173")?,
        })
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        info!("Environment variable {key} not found");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {key} value: {e}"))
}
