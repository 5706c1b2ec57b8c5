use crate::error::{PhotoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// A point on the map. Lookups compare both components for exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(PhotoError::InvalidArgument(format!(
                "latitude {} is outside [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(PhotoError::InvalidArgument(format!(
                "longitude {} is outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub i64);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub id: LocationId,
    #[serde(flatten)]
    pub coordinate: Coordinate,
    /// Total result pages reported by the last successful search. Never decreases.
    pub page_count: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A cached photo. `id` is the remote photo id and is unique within its location.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoRecord {
    pub id: String,
    pub location_id: LocationId,
    pub image_url: String,
    pub image_bytes: Option<Vec<u8>>,
    pub created_at: OffsetDateTime,
}

/// A cached photo without its blob, for listings and change diffs.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoSummary {
    pub id: String,
    pub location_id: LocationId,
    pub image_url: String,
    pub has_image: bool,
    pub created_at: OffsetDateTime,
}

impl From<&PhotoRecord> for PhotoSummary {
    fn from(record: &PhotoRecord) -> Self {
        Self {
            id: record.id.clone(),
            location_id: record.location_id,
            image_url: record.image_url.clone(),
            has_image: record.image_bytes.is_some(),
            created_at: record.created_at,
        }
    }
}

/// Input for index writes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPhoto {
    pub id: String,
    pub image_url: String,
    pub image_bytes: Option<Vec<u8>>,
}

impl NewPhoto {
    pub fn new(id: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_url: image_url.into(),
            image_bytes: None,
        }
    }

    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.image_bytes = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePhoto {
    pub id: String,
    pub image_url: String,
}

impl From<RemotePhoto> for NewPhoto {
    fn from(photo: RemotePhoto) -> Self {
        NewPhoto::new(photo.id, photo.image_url)
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub page: u32,
    pub total_pages: u32,
    pub photos: Vec<RemotePhoto>,
}

/// Published after every mutation of a location's photo set.
#[derive(Debug, Clone)]
pub struct PhotoSetChange {
    pub location_id: LocationId,
    pub coordinate: Coordinate,
    pub before: Vec<PhotoSummary>,
    pub after: Vec<PhotoSummary>,
}

impl PhotoSetChange {
    pub fn removed_ids(&self) -> Vec<&str> {
        self.before
            .iter()
            .filter(|old| !self.after.iter().any(|new| new.id == old.id))
            .map(|old| old.id.as_str())
            .collect()
    }

    pub fn inserted_ids(&self) -> Vec<&str> {
        self.after
            .iter()
            .filter(|new| !self.before.iter().any(|old| old.id == new.id))
            .map(|new| new.id.as_str())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct CoordinateQuery {
    pub lat: f64,
    pub lon: f64,
}

impl From<CoordinateQuery> for Coordinate {
    fn from(query: CoordinateQuery) -> Self {
        Coordinate::new(query.lat, query.lon)
    }
}

#[derive(Debug, Deserialize)]
pub struct PhotoImageQuery {
    pub lat: f64,
    pub lon: f64,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeletePhotosRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PhotoResponse {
    pub id: String,
    pub image_url: String,
    pub has_image: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&PhotoSummary> for PhotoResponse {
    fn from(photo: &PhotoSummary) -> Self {
        Self {
            id: photo.id.clone(),
            image_url: photo.image_url.clone(),
            has_image: photo.has_image,
            created_at: photo.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PhotosResponse {
    pub latitude: f64,
    pub longitude: f64,
    pub photos: Vec<PhotoResponse>,
    pub total: usize,
}

impl PhotosResponse {
    pub fn new(coordinate: Coordinate, photos: &[PhotoSummary]) -> Self {
        Self {
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            photos: photos.iter().map(PhotoResponse::from).collect(),
            total: photos.len(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PrefetchReport {
    pub total: usize,
    pub fetched: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}
