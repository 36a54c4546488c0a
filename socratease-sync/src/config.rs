use std::path::PathBuf;

use anyhow::Context;

const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub page_size: u32,
    pub database_path: Option<PathBuf>,
}

impl ConnectorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key =
            std::env::var("SOCRATEASE_API_KEY").context("SOCRATEASE_API_KEY is not set")?;
        let base_url = std::env::var("SOCRATEASE_BASE_URL").ok();
        let page_size = read_u32_env("SOCRATEASE_PAGE_SIZE", DEFAULT_PAGE_SIZE);
        let database_path = std::env::var("SOCRATEASE_DB").ok().map(PathBuf::from);
        Ok(Self {
            api_key,
            base_url,
            page_size,
            database_path,
        })
    }
}

fn read_u32_env(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
