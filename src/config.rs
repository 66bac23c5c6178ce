use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Credentials and refresh policy for the Jira source. Credentials are
/// optional at startup; a fetch without them fails and is handled like any
/// other upstream failure.
#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub server: Option<String>,
    pub email: Option<String>,
    pub api_token: Option<String>,
    pub jql: Option<String>,
    pub refresh_interval: Duration,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct FreshserviceConfig {
    pub domain: Option<String>,
    pub api_key: Option<String>,
    pub refresh_interval: Duration,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub anthropic_api_key: String,
    pub model: String,
    pub jira: JiraConfig,
    pub freshservice: FreshserviceConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let anthropic_api_key = env_opt("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY not found in environment variables")?;

        Ok(Self {
            api_host: env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: env_opt("API_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(9000),
            data_dir: env_opt("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            anthropic_api_key,
            model: env_opt("ANTHROPIC_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            jira: JiraConfig {
                server: env_opt("JIRA_SERVER"),
                email: env_opt("JIRA_EMAIL"),
                api_token: env_opt("JIRA_API_TOKEN"),
                jql: env_opt("JIRA_JQL"),
                refresh_interval: Duration::from_secs(env_u64("JIRA_REFRESH_INTERVAL", 3600)),
                cache_ttl: Duration::from_secs(env_u64("JIRA_CACHE_HOURS", 24) * 3600),
            },
            freshservice: FreshserviceConfig {
                domain: env_opt("FRESHSERVICE_DOMAIN"),
                api_key: env_opt("FRESHSERVICE_API_KEY"),
                refresh_interval: Duration::from_secs(env_u64(
                    "FRESHSERVICE_REFRESH_INTERVAL",
                    3600,
                )),
                cache_ttl: Duration::from_secs(env_u64("FRESHSERVICE_CACHE_HOURS", 24) * 3600),
            },
        })
    }
}
