use crate::cache::{InflightLoads, PhotoSet};
use crate::error::{PhotoError, Result};
use crate::flickr::PhotoSearch;
use crate::models::{
    Coordinate, Location, LocationId, NewPhoto, PhotoSetChange, PhotoSummary, PrefetchReport,
    SearchPage,
};
use crate::store::LocationPhotoIndex;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub per_page: u32,
    pub inflight_capacity: usize,
    pub prefetch_concurrency: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            per_page: 18,
            inflight_capacity: 1024,
            prefetch_concurrency: 4,
        }
    }
}

/// One writer per location at a time; different locations proceed independently.
#[derive(Clone, Default)]
struct WriteLocks {
    locks: Arc<DashMap<LocationId, Arc<Mutex<()>>>>,
}

impl WriteLocks {
    async fn acquire(&self, id: LocationId) -> WriteGuard {
        let lock = self.locks.entry(id).or_default().clone();
        let guard = lock.lock_owned().await;
        WriteGuard {
            id,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }
}

/// Exclusive write access to one location. The map entry goes away with the
/// last holder or waiter.
struct WriteGuard {
    id: LocationId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<LocationId, Arc<Mutex<()>>>>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Orchestrates the photo use cases for a pin on top of the index and the search client.
///
/// The coordinator never touches storage except through [`LocationPhotoIndex`],
/// and every index call runs on the blocking pool. Dropping a returned future
/// before its write starts leaves the index untouched; a write that has
/// started runs to completion under the location's lock.
pub struct PhotoCacheCoordinator<I, S> {
    index: Arc<I>,
    search: Arc<S>,
    inflight: InflightLoads,
    writers: WriteLocks,
    changes: broadcast::Sender<PhotoSetChange>,
    settings: CoordinatorSettings,
}

impl<I: LocationPhotoIndex, S: PhotoSearch> PhotoCacheCoordinator<I, S> {
    pub fn new(index: I, search: S, settings: CoordinatorSettings) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            index: Arc::new(index),
            search: Arc::new(search),
            inflight: InflightLoads::new(settings.inflight_capacity),
            writers: WriteLocks::default(),
            changes,
            settings,
        }
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    /// Change feed for UI layers that diff photo sets themselves.
    pub fn subscribe(&self) -> broadcast::Receiver<PhotoSetChange> {
        self.changes.subscribe()
    }

    async fn with_index<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&I) -> Result<T> + Send + 'static,
    {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || f(&index))
            .await
            .map_err(|e| PhotoError::StorageError(format!("index task failed: {}", e)))?
    }

    async fn existing_location(&self, coordinate: Coordinate) -> Result<Location> {
        coordinate.validate()?;
        self.with_index(move |index| index.find_location(coordinate))
            .await?
            .ok_or_else(|| PhotoError::NotFound(format!("no pin at {}", coordinate)))
    }

    fn publish(
        &self,
        location: LocationId,
        coordinate: Coordinate,
        before: Vec<PhotoSummary>,
        after: Vec<PhotoSummary>,
    ) {
        // no subscribers is fine
        let _ = self.changes.send(PhotoSetChange {
            location_id: location,
            coordinate,
            before,
            after,
        });
    }

    /// Runs a locked write on its own task. The lock is released only after
    /// the transaction has finished and the change went out, even when the
    /// caller stops waiting halfway.
    async fn commit<F>(
        &self,
        guard: WriteGuard,
        coordinate: Coordinate,
        write: F,
    ) -> Result<Vec<PhotoSummary>>
    where
        F: FnOnce(&I) -> Result<(Vec<PhotoSummary>, Vec<PhotoSummary>)> + Send + 'static,
    {
        let id = guard.id;
        let index = Arc::clone(&self.index);
        let inflight = self.inflight.clone();
        let changes = self.changes.clone();

        tokio::spawn(async move {
            let (before, after) = tokio::task::spawn_blocking(move || write(&index))
                .await
                .map_err(|e| PhotoError::StorageError(format!("index task failed: {}", e)))??;
            inflight.forget(id).await;
            debug!(
                location_id = %id,
                before = before.len(),
                after = after.len(),
                "Committed photo set"
            );
            let _ = changes.send(PhotoSetChange {
                location_id: id,
                coordinate,
                before,
                after: after.clone(),
            });
            drop(guard);
            Ok::<_, PhotoError>(after)
        })
        .await
        .map_err(|e| PhotoError::StorageError(format!("write task failed: {}", e)))?
    }

    pub async fn add_pin(&self, coordinate: Coordinate) -> Result<Location> {
        coordinate.validate()?;
        let location = self
            .with_index(move |index| {
                let id = index.upsert_location(coordinate)?;
                index.get_location(id)
            })
            .await?;
        info!(location_id = %location.id, %coordinate, "Pin added");
        Ok(location)
    }

    pub async fn list_pins(&self) -> Result<Vec<Location>> {
        self.with_index(|index| index.list_locations()).await
    }

    pub async fn remove_pin(&self, coordinate: Coordinate) -> Result<()> {
        let location = self.existing_location(coordinate).await?;
        let id = location.id;
        let guard = self.writers.acquire(id).await;
        self.commit(guard, coordinate, move |index| {
            let before = index.list_photo_summaries(id)?;
            index.delete_location(id)?;
            Ok((before, Vec::new()))
        })
        .await?;
        info!(location_id = %id, %coordinate, "Pin removed");
        Ok(())
    }

    /// Photos for a pin, searching page 1 only when nothing is cached yet.
    ///
    /// Concurrent calls for one location share a single search.
    pub async fn load_photos(&self, coordinate: Coordinate) -> Result<Vec<PhotoSummary>> {
        coordinate.validate()?;
        let id = self
            .with_index(move |index| index.upsert_location(coordinate))
            .await?;

        let photos = self
            .inflight
            .run(id, self.populate(id, coordinate))
            .await?;
        Ok(photos.as_ref().clone())
    }

    async fn populate(&self, id: LocationId, coordinate: Coordinate) -> Result<PhotoSet> {
        let (location, photos) = self.current_state(id).await?;
        if !photos.is_empty() || location.page_count.is_some() {
            debug!(location_id = %id, photos = photos.len(), "Serving cached photos");
            return Ok(Arc::new(photos));
        }

        info!(location_id = %id, %coordinate, "No cached photos, searching first page");
        let page = self
            .search
            .search(coordinate, 1, self.settings.per_page)
            .await?;

        let guard = self.writers.acquire(id).await;
        // an abandoned load may have landed while we were searching
        let (location, photos) = self.current_state(id).await?;
        if !photos.is_empty() || location.page_count.is_some() {
            debug!(location_id = %id, "Location was populated meanwhile, keeping it");
            return Ok(Arc::new(photos));
        }
        let after = self.store_page(guard, coordinate, page).await?;
        Ok(Arc::new(after))
    }

    async fn current_state(&self, id: LocationId) -> Result<(Location, Vec<PhotoSummary>)> {
        self.with_index(move |index| {
            Ok((index.get_location(id)?, index.list_photo_summaries(id)?))
        })
        .await
    }

    /// Swaps the photo set for a random page of results.
    pub async fn refresh_collection(&self, coordinate: Coordinate) -> Result<Vec<PhotoSummary>> {
        let location = self.existing_location(coordinate).await?;
        let id = location.id;
        let guard = self.writers.acquire(id).await;

        // a writer that held the lock before us may have changed the page count
        let location = self.with_index(move |index| index.get_location(id)).await?;
        let total_pages = location.page_count.ok_or_else(|| {
            PhotoError::PreconditionFailed(format!(
                "no search has completed for {} yet",
                coordinate
            ))
        })?;
        let page = self.search.random_page(total_pages)?;

        info!(location_id = %id, page, total_pages, "Refreshing photo collection");
        let result = self
            .search
            .search(coordinate, page, self.settings.per_page)
            .await?;
        self.store_page(guard, coordinate, result).await
    }

    async fn store_page(
        &self,
        guard: WriteGuard,
        coordinate: Coordinate,
        page: SearchPage,
    ) -> Result<Vec<PhotoSummary>> {
        let id = guard.id;
        let total_pages = page.total_pages;
        let records: Vec<NewPhoto> = page.photos.into_iter().map(NewPhoto::from).collect();

        let after = self
            .commit(guard, coordinate, move |index| {
                let before = index.list_photo_summaries(id)?;
                index.apply_search_page(id, total_pages, &records)?;
                Ok((before, index.list_photo_summaries(id)?))
            })
            .await?;

        info!(location_id = %id, total_pages, stored = after.len(), "Stored search results");
        Ok(after)
    }

    /// Removes the selected photos and returns what is left. An empty result
    /// is not refilled here; the caller decides whether to refresh.
    pub async fn delete_photos(
        &self,
        coordinate: Coordinate,
        photo_ids: Vec<String>,
    ) -> Result<Vec<PhotoSummary>> {
        let location = self.existing_location(coordinate).await?;
        let id = location.id;
        let guard = self.writers.acquire(id).await;

        let after = self
            .commit(guard, coordinate, move |index| {
                let before = index.list_photo_summaries(id)?;
                index.delete_photos(id, &photo_ids)?;
                Ok((before, index.list_photo_summaries(id)?))
            })
            .await?;

        info!(location_id = %id, remaining = after.len(), "Deleted photos");
        Ok(after)
    }

    /// Downloads image bytes for every photo of the pin that lacks them.
    /// A failed download only affects that photo, which stays retryable.
    pub async fn prefetch_images(&self, coordinate: Coordinate) -> Result<PrefetchReport> {
        let location = self.existing_location(coordinate).await?;
        let id = location.id;

        let before = self
            .with_index(move |index| index.list_photo_summaries(id))
            .await?;
        let pending: Vec<(String, String)> = before
            .iter()
            .filter(|photo| !photo.has_image)
            .map(|photo| (photo.id.clone(), photo.image_url.clone()))
            .collect();

        let mut report = PrefetchReport {
            total: pending.len(),
            ..PrefetchReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let results: Vec<(String, Result<()>)> = stream::iter(pending)
            .map(|(photo_id, url)| async move {
                let outcome = self.fetch_and_store(id, &photo_id, &url).await;
                (photo_id, outcome)
            })
            .buffer_unordered(self.settings.prefetch_concurrency.max(1))
            .collect()
            .await;

        for (photo_id, outcome) in results {
            match outcome {
                Ok(()) => report.fetched += 1,
                Err(e) => {
                    warn!(location_id = %id, photo_id = %photo_id, error = %e, "Image download failed");
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", photo_id, e));
                }
            }
        }

        if report.fetched > 0 {
            let after = self
                .with_index(move |index| index.list_photo_summaries(id))
                .await?;
            self.inflight.forget(id).await;
            self.publish(id, coordinate, before, after);
        }

        info!(
            location_id = %id,
            fetched = report.fetched,
            failed = report.failed,
            "Prefetch finished"
        );
        Ok(report)
    }

    async fn fetch_and_store(&self, id: LocationId, photo_id: &str, url: &str) -> Result<()> {
        let bytes = self.search.fetch_image_bytes(url).await?;
        image::guess_format(&bytes).map_err(|e| {
            PhotoError::InvalidResponse(format!("{} is not a recognised image: {}", url, e))
        })?;

        let photo_id = photo_id.to_string();
        self.with_index(move |index| index.set_image_bytes(id, &photo_id, &bytes))
            .await
    }

    /// Cached bytes for one photo of a pin.
    pub async fn photo_image(&self, coordinate: Coordinate, photo_id: String) -> Result<Vec<u8>> {
        let location = self.existing_location(coordinate).await?;
        let id = location.id;
        let lookup = photo_id.clone();
        self.with_index(move |index| index.photo_bytes(id, &lookup))
            .await?
            .ok_or_else(|| {
                PhotoError::NotFound(format!("photo {} has not been downloaded yet", photo_id))
            })
    }
}
