#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use geo_photo_cache::models::{
    Coordinate, Location, LocationId, NewPhoto, PhotoRecord, PhotoSummary, RemotePhoto,
    SearchPage,
};
use geo_photo_cache::{
    CoordinatorSettings, LocationPhotoIndex, PhotoCacheCoordinator, PhotoError, PhotoSearch,
    Result, SqliteIndex,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Smallest valid PNG signature plus header chunk, enough for format sniffing.
pub const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52,
];

pub fn remote(id: &str) -> RemotePhoto {
    RemotePhoto {
        id: id.to_string(),
        image_url: format!("https://farm1.staticflickr.com/1/{}_s.jpg", id),
    }
}

pub fn page(total_pages: u32, ids: &[&str]) -> SearchPage {
    SearchPage {
        page: 1,
        total_pages,
        photos: ids.iter().map(|id| remote(id)).collect(),
    }
}

/// Scripted stand-in for the photo search service.
#[derive(Clone, Default)]
pub struct MockSearch {
    inner: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    pages: Mutex<HashMap<u32, SearchPage>>,
    fallback: Mutex<Option<SearchPage>>,
    failure: Mutex<Option<PhotoError>>,
    images: Mutex<HashMap<String, Result<Vec<u8>>>>,
    requested_pages: Mutex<Vec<u32>>,
    fixed_page: Mutex<Option<u32>>,
    search_calls: AtomicUsize,
    image_calls: AtomicUsize,
    delay_ms: AtomicU64,
}

impl MockSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response for any page without a specific entry.
    pub fn respond_with(&self, page: SearchPage) -> &Self {
        *self.inner.fallback.lock().unwrap() = Some(page);
        self
    }

    pub fn respond_on_page(&self, number: u32, page: SearchPage) -> &Self {
        self.inner.pages.lock().unwrap().insert(number, page);
        self
    }

    pub fn fail_with(&self, error: Option<PhotoError>) -> &Self {
        *self.inner.failure.lock().unwrap() = error;
        self
    }

    pub fn image(&self, url: &str, bytes: Result<Vec<u8>>) -> &Self {
        self.inner.images.lock().unwrap().insert(url.to_string(), bytes);
        self
    }

    pub fn always_pick_page(&self, page: u32) -> &Self {
        *self.inner.fixed_page.lock().unwrap() = Some(page);
        self
    }

    pub fn set_delay(&self, delay: Duration) -> &Self {
        self.inner
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn search_calls(&self) -> usize {
        self.inner.search_calls.load(Ordering::SeqCst)
    }

    pub fn image_calls(&self) -> usize {
        self.inner.image_calls.load(Ordering::SeqCst)
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.inner.requested_pages.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhotoSearch for MockSearch {
    async fn search(&self, _coordinate: Coordinate, page: u32, _per_page: u32) -> Result<SearchPage> {
        self.inner.search_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.requested_pages.lock().unwrap().push(page);

        let delay = self.inner.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(error) = self.inner.failure.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(result) = self.inner.pages.lock().unwrap().get(&page) {
            return Ok(result.clone());
        }
        self.inner
            .fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PhotoError::NetworkError("no scripted response".to_string()))
    }

    async fn fetch_image_bytes(&self, url: &str) -> Result<Bytes> {
        self.inner.image_calls.fetch_add(1, Ordering::SeqCst);
        match self.inner.images.lock().unwrap().get(url) {
            Some(Ok(bytes)) => Ok(Bytes::from(bytes.clone())),
            Some(Err(e)) => Err(e.clone()),
            None => Err(PhotoError::NetworkError(format!("404 for {}", url))),
        }
    }

    fn random_page(&self, total_pages: u32) -> Result<u32> {
        match *self.inner.fixed_page.lock().unwrap() {
            Some(page) => Ok(page),
            None => geo_photo_cache::flickr::random_page(total_pages),
        }
    }
}

pub fn temp_index() -> (TempDir, SqliteIndex) {
    let dir = tempfile::tempdir().unwrap();
    let index = SqliteIndex::open(dir.path().join("photos.db")).unwrap();
    (dir, index)
}

pub fn coordinator(search: MockSearch) -> (TempDir, Arc<PhotoCacheCoordinator<SqliteIndex, MockSearch>>) {
    let (dir, index) = temp_index();
    let coordinator = PhotoCacheCoordinator::new(index, search, CoordinatorSettings::default());
    (dir, Arc::new(coordinator))
}

/// SQLite index whose next `apply_search_page` can be made to stall, and which
/// records how many of those writes ever overlapped.
#[derive(Clone)]
pub struct SlowIndex {
    inner: SqliteIndex,
    stall_ms: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl SlowIndex {
    pub fn new(inner: SqliteIndex) -> Self {
        Self {
            inner,
            stall_ms: Arc::default(),
            active: Arc::default(),
            max_active: Arc::default(),
        }
    }

    /// Only the next `apply_search_page` call stalls.
    pub fn stall_next_apply(&self, delay: Duration) {
        self.stall_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn max_concurrent_applies(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl LocationPhotoIndex for SlowIndex {
    fn upsert_location(&self, coordinate: Coordinate) -> Result<LocationId> {
        self.inner.upsert_location(coordinate)
    }

    fn find_location(&self, coordinate: Coordinate) -> Result<Option<Location>> {
        self.inner.find_location(coordinate)
    }

    fn get_location(&self, id: LocationId) -> Result<Location> {
        self.inner.get_location(id)
    }

    fn list_locations(&self) -> Result<Vec<Location>> {
        self.inner.list_locations()
    }

    fn set_page_count(&self, id: LocationId, count: u32) -> Result<()> {
        self.inner.set_page_count(id, count)
    }

    fn replace_photos(&self, id: LocationId, records: &[NewPhoto]) -> Result<()> {
        self.inner.replace_photos(id, records)
    }

    fn add_photos(&self, id: LocationId, records: &[NewPhoto]) -> Result<()> {
        self.inner.add_photos(id, records)
    }

    fn apply_search_page(
        &self,
        id: LocationId,
        total_pages: u32,
        records: &[NewPhoto],
    ) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let stall = self.stall_ms.swap(0, Ordering::SeqCst);
        if stall > 0 {
            std::thread::sleep(Duration::from_millis(stall));
        }
        let result = self.inner.apply_search_page(id, total_pages, records);

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn set_image_bytes(&self, id: LocationId, photo_id: &str, bytes: &[u8]) -> Result<()> {
        self.inner.set_image_bytes(id, photo_id, bytes)
    }

    fn delete_photos(&self, id: LocationId, photo_ids: &[String]) -> Result<usize> {
        self.inner.delete_photos(id, photo_ids)
    }

    fn delete_location(&self, id: LocationId) -> Result<()> {
        self.inner.delete_location(id)
    }

    fn list_photos(&self, id: LocationId) -> Result<Vec<PhotoRecord>> {
        self.inner.list_photos(id)
    }

    fn list_photo_summaries(&self, id: LocationId) -> Result<Vec<PhotoSummary>> {
        self.inner.list_photo_summaries(id)
    }

    fn photo_bytes(&self, id: LocationId, photo_id: &str) -> Result<Option<Vec<u8>>> {
        self.inner.photo_bytes(id, photo_id)
    }
}

pub fn slow_coordinator(
    search: MockSearch,
) -> (
    TempDir,
    SlowIndex,
    Arc<PhotoCacheCoordinator<SlowIndex, MockSearch>>,
) {
    let (dir, index) = temp_index();
    let slow = SlowIndex::new(index);
    let coordinator =
        PhotoCacheCoordinator::new(slow.clone(), search, CoordinatorSettings::default());
    (dir, slow, Arc::new(coordinator))
}
