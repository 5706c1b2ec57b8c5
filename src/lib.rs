//! Location-keyed photo cache: pins on a map, photos near each pin fetched from
//! a public photo search service and kept in a local index for offline use.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flickr;
pub mod handlers;
pub mod limiter;
pub mod middleware;
pub mod models;
pub mod store;

pub use coordinator::{CoordinatorSettings, PhotoCacheCoordinator};
pub use error::{PhotoError, Result};
pub use flickr::{FlickrClient, PhotoSearch};
pub use store::{LocationPhotoIndex, SqliteIndex};

pub type Coordinator = PhotoCacheCoordinator<SqliteIndex, FlickrClient>;
