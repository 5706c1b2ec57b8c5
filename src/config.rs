use crate::coordinator::CoordinatorSettings;
use crate::flickr::{FlickrSettings, DEFAULT_ENDPOINT, MAX_PER_PAGE};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    #[arg(long, env = "DATABASE_PATH", default_value = "photos.db")]
    pub database_path: PathBuf,

    #[arg(long, env = "FLICKR_API_KEY", hide_env_values = true)]
    pub flickr_api_key: String,

    #[arg(long, env = "FLICKR_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub flickr_endpoint: String,

    #[arg(long, env = "PER_PAGE", default_value = "18")]
    pub per_page: u32,

    #[arg(long, env = "SAFE_SEARCH", default_value = "1")]
    pub safe_search: u8,

    #[arg(long, env = "RATE_LIMIT_REQUESTS", default_value = "5")]
    pub rate_limit_requests: u32,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "1")]
    pub rate_limit_window_secs: u64,

    #[arg(long, env = "INFLIGHT_CAPACITY", default_value = "1024")]
    pub inflight_capacity: usize,

    #[arg(long, env = "PREFETCH_CONCURRENCY", default_value = "4")]
    pub prefetch_concurrency: usize,

    #[arg(long, env = "MAX_IMAGE_BYTES", default_value = "10485760")]
    pub max_image_bytes: usize,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flickr_api_key.trim().is_empty() {
            bail!("FLICKR_API_KEY cannot be empty");
        }
        if !(1..=MAX_PER_PAGE).contains(&self.per_page) {
            bail!("per_page must be between 1 and {}", MAX_PER_PAGE);
        }
        if !(1..=3).contains(&self.safe_search) {
            bail!("safe_search must be 1, 2 or 3");
        }
        if self.rate_limit_requests == 0 || self.rate_limit_window_secs == 0 {
            bail!("rate limit requests and window must be greater than zero");
        }
        if self.prefetch_concurrency == 0 {
            bail!("prefetch_concurrency must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        self.endpoint()?;
        Ok(())
    }

    fn endpoint(&self) -> Result<Url> {
        Url::parse(&self.flickr_endpoint)
            .with_context(|| format!("invalid flickr endpoint {}", self.flickr_endpoint))
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn flickr_settings(&self) -> Result<FlickrSettings> {
        Ok(FlickrSettings {
            endpoint: self.endpoint()?,
            api_key: self.flickr_api_key.clone(),
            safe_search: self.safe_search,
            max_image_bytes: self.max_image_bytes,
        })
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            per_page: self.per_page,
            inflight_capacity: self.inflight_capacity,
            prefetch_concurrency: self.prefetch_concurrency,
        }
    }
}
