use std::path::PathBuf;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Contains only secrets and env-specific values; sources, schedule and
/// thresholds live in the TOML FileConfig.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Storage
    pub database_url: Option<String>,
    pub landing_dir: PathBuf,

    // TOML
    pub config_path: PathBuf,

    // Social-post source (app-only OAuth)
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
    pub reddit_user_agent: String,

    // Employee-review source (RapidAPI)
    pub rapidapi_key: Option<String>,
    pub rapidapi_host: Option<String>,

    // Trend-sample source
    pub serpapi_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: non_empty_env("DATABASE_URL"),
            landing_dir: std::env::var("LANDING_DIR")
                .unwrap_or_else(|_| "./landing".to_string())
                .into(),
            config_path: std::env::var("PULSE_CONFIG")
                .unwrap_or_else(|_| "pulse.toml".to_string())
                .into(),
            reddit_client_id: non_empty_env("REDDIT_CLIENT_ID"),
            reddit_client_secret: non_empty_env("REDDIT_CLIENT_SECRET"),
            reddit_user_agent: std::env::var("REDDIT_USER_AGENT")
                .unwrap_or_else(|_| "pulse-ingest/0.1".to_string()),
            rapidapi_key: non_empty_env("RAPIDAPI_KEY"),
            rapidapi_host: non_empty_env("RAPIDAPI_HOST"),
            serpapi_key: non_empty_env("SERPAPI_KEY"),
        };

        config.log_keys();
        Ok(config)
    }

    /// Reddit client credentials, or an error naming what is missing.
    pub fn reddit_credentials(&self) -> Result<(String, String)> {
        let id = self
            .reddit_client_id
            .clone()
            .context("REDDIT_CLIENT_ID required for social-post sources")?;
        let secret = self
            .reddit_client_secret
            .clone()
            .context("REDDIT_CLIENT_SECRET required for social-post sources")?;
        Ok((id, secret))
    }

    fn log_keys(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!(
            "  DATABASE_URL: {}",
            if self.database_url.is_some() { "<set>" } else { "<not set, using in-memory stores>" }
        );
        tracing::info!("  LANDING_DIR: {}", self.landing_dir.display());
        tracing::info!("  PULSE_CONFIG: {}", self.config_path.display());
        tracing::info!("  REDDIT_CLIENT_ID: {}", preview_opt(&self.reddit_client_id));
        tracing::info!("  REDDIT_CLIENT_SECRET: {}", preview_opt(&self.reddit_client_secret));
        tracing::info!("  RAPIDAPI_KEY: {}", preview_opt(&self.rapidapi_key));
        tracing::info!("  RAPIDAPI_HOST: {}", preview_opt(&self.rapidapi_host));
        tracing::info!("  SERPAPI_KEY: {}", preview_opt(&self.serpapi_key));
    }
}

/// First five characters of a secret, cut on a char boundary.
fn preview(val: &str) -> String {
    let head: String = val.chars().take(5).collect();
    format!("{head}...({} chars)", val.chars().count())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
