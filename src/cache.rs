use crate::error::{PhotoError, Result};
use crate::models::{LocationId, PhotoSummary};
use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub type PhotoSet = Arc<Vec<PhotoSummary>>;

/// Coalesces concurrent loads of the same location onto one future.
///
/// Entries only live for the duration of a load; the index stays the source
/// of truth. If the leading caller is cancelled, a waiting caller takes over.
#[derive(Clone)]
pub struct InflightLoads {
    cache: Arc<Cache<LocationId, PhotoSet>>,
}

impl InflightLoads {
    pub fn new(max_capacity: usize) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity as u64)
            .time_to_live(Duration::from_secs(60))
            .build();

        Self {
            cache: Arc::new(cache),
        }
    }

    pub async fn run<F>(&self, id: LocationId, load: F) -> Result<PhotoSet>
    where
        F: Future<Output = Result<PhotoSet>>,
    {
        let result = self
            .cache
            .try_get_with(id, load)
            .await
            .map_err(|e: Arc<PhotoError>| PhotoError::clone(&e));
        self.cache.invalidate(&id).await;
        result
    }

    /// Drops any settled result so the next load re-reads the index.
    pub async fn forget(&self, id: LocationId) {
        self.cache.invalidate(&id).await;
    }
}
