use crate::error::{PhotoError, Result};
use crate::limiter::OutboundLimiter;
use crate::models::{Coordinate, RemotePhoto, SearchPage};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use rand::Rng;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://api.flickr.com/services/rest/";
pub const MAX_PER_PAGE: u32 = 500;

/// Narrow contract to the external photo service: one search call, one image fetch.
/// Retry, backoff and concurrency are the caller's business.
#[async_trait]
pub trait PhotoSearch: Send + Sync + 'static {
    async fn search(&self, coordinate: Coordinate, page: u32, per_page: u32)
        -> Result<SearchPage>;

    async fn fetch_image_bytes(&self, url: &str) -> Result<Bytes>;

    fn random_page(&self, total_pages: u32) -> Result<u32> {
        random_page(total_pages)
    }
}

/// Uniform pick from `1..=total_pages`.
pub fn random_page(total_pages: u32) -> Result<u32> {
    if total_pages < 1 {
        return Err(PhotoError::InvalidArgument(
            "total pages must be at least 1".to_string(),
        ));
    }
    Ok(rand::thread_rng().gen_range(1..=total_pages))
}

pub fn photo_url(farm: &str, server: &str, id: &str, secret: &str) -> String {
    format!(
        "https://farm{}.staticflickr.com/{}/{}_{}.jpg",
        farm, server, id, secret
    )
}

#[derive(Debug, Clone)]
pub struct FlickrSettings {
    pub endpoint: Url,
    pub api_key: String,
    pub safe_search: u8,
    pub max_image_bytes: usize,
}

#[derive(Clone)]
pub struct FlickrClient {
    http: reqwest::Client,
    settings: FlickrSettings,
    limiter: OutboundLimiter,
}

impl FlickrClient {
    pub fn new(settings: FlickrSettings, limiter: OutboundLimiter) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            settings,
            limiter,
        })
    }

    fn search_url(&self, coordinate: Coordinate, page: u32, per_page: u32) -> Url {
        let mut url = self.settings.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("method", "flickr.photos.search")
            .append_pair("api_key", &self.settings.api_key)
            .append_pair("lat", &coordinate.latitude.to_string())
            .append_pair("lon", &coordinate.longitude.to_string())
            .append_pair("format", "json")
            .append_pair("nojsoncallback", "1")
            .append_pair("safe_search", &self.settings.safe_search.to_string())
            .append_pair("page", &page.to_string())
            .append_pair("per_page", &per_page.to_string());
        url
    }
}

#[async_trait]
impl PhotoSearch for FlickrClient {
    async fn search(
        &self,
        coordinate: Coordinate,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage> {
        coordinate.validate()?;
        if page < 1 {
            return Err(PhotoError::InvalidArgument(
                "page numbers start at 1".to_string(),
            ));
        }
        if !(1..=MAX_PER_PAGE).contains(&per_page) {
            return Err(PhotoError::InvalidArgument(format!(
                "per_page must be between 1 and {}",
                MAX_PER_PAGE
            )));
        }

        self.limiter.acquire().await;
        debug!(%coordinate, page, per_page, "Searching photos");

        let response = self
            .http
            .get(self.search_url(coordinate, page, per_page))
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;

        let result = parse_search_response(&body)?;
        debug!(
            %coordinate,
            page = result.page,
            total_pages = result.total_pages,
            photos = result.photos.len(),
            "Search completed"
        );
        Ok(result)
    }

    async fn fetch_image_bytes(&self, url: &str) -> Result<Bytes> {
        let parsed = Url::parse(url)
            .map_err(|e| PhotoError::InvalidArgument(format!("invalid image url {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PhotoError::InvalidArgument(format!(
                "unsupported image url scheme: {}",
                parsed.scheme()
            )));
        }

        self.limiter.acquire().await;
        let response = self.http.get(parsed).send().await?.error_for_status()?;

        let limit = self.settings.max_image_bytes;
        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                return Err(PhotoError::InvalidResponse(format!(
                    "image at {} is {} bytes, limit is {}",
                    url, length, limit
                )));
            }
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > limit {
                return Err(PhotoError::InvalidResponse(format!(
                    "image at {} exceeds {} bytes",
                    url, limit
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}

#[derive(Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    stat: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    photos: Option<PhotosPayload>,
}

#[derive(Deserialize)]
struct PhotosPayload {
    #[serde(default, deserialize_with = "lenient_u32")]
    page: u32,
    #[serde(default, deserialize_with = "lenient_u32")]
    pages: u32,
    #[serde(default)]
    photo: Vec<PhotoPayload>,
}

#[derive(Deserialize)]
struct PhotoPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    farm: String,
    #[serde(default, deserialize_with = "lenient_string")]
    server: String,
    #[serde(default, deserialize_with = "lenient_string")]
    secret: String,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

/// Turns a `flickr.photos.search` JSON body into a [`SearchPage`].
pub fn parse_search_response(body: &[u8]) -> Result<SearchPage> {
    let envelope: SearchEnvelope = serde_json::from_slice(body)?;

    if envelope.stat.as_deref() == Some("fail") {
        return Err(PhotoError::NetworkError(format!(
            "photo search api error {}: {}",
            envelope.code,
            envelope.message.unwrap_or_default()
        )));
    }

    let payload = envelope.photos.ok_or_else(|| {
        PhotoError::InvalidResponse("response has no photos object".to_string())
    })?;

    let photos = payload
        .photo
        .into_iter()
        .filter_map(|p| {
            if p.id.is_empty() {
                warn!("Skipping search result without an id");
                return None;
            }
            Some(RemotePhoto {
                image_url: photo_url(&p.farm, &p.server, &p.id, &p.secret),
                id: p.id,
            })
        })
        .collect();

    Ok(SearchPage {
        page: payload.page,
        total_pages: payload.pages,
        photos,
    })
}
