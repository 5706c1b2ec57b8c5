use serde::Serialize;
use tracing::error;
use warp::{http::StatusCode, reject::Reject, Rejection, Reply};

pub type Result<T, E = PhotoError> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PhotoError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<rusqlite::Error> for PhotoError {
    fn from(e: rusqlite::Error) -> Self {
        PhotoError::StorageError(e.to_string())
    }
}

impl From<r2d2::Error> for PhotoError {
    fn from(e: r2d2::Error) -> Self {
        PhotoError::StorageError(format!("connection pool: {}", e))
    }
}

impl From<reqwest::Error> for PhotoError {
    fn from(e: reqwest::Error) -> Self {
        PhotoError::NetworkError(e.to_string())
    }
}

impl From<serde_json::Error> for PhotoError {
    fn from(e: serde_json::Error) -> Self {
        PhotoError::InvalidResponse(e.to_string())
    }
}

impl Reject for PhotoError {}

/// Raised by the HTTP layer when an operation outlives its deadline.
#[derive(Debug)]
pub struct DeadlineExceeded;

impl Reject for DeadlineExceeded {}

#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, std::convert::Infallible> {
    let (code, message) = if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        error!("Deserialization error details: {}", e);
        (
            StatusCode::BAD_REQUEST,
            "Invalid request body. Please check the API documentation for required fields."
                .to_string(),
        )
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        error!("Query error details: {}", e);
        (
            StatusCode::BAD_REQUEST,
            "Invalid query string. Expected numeric lat and lon parameters.".to_string(),
        )
    } else if let Some(e) = err.find::<PhotoError>() {
        match e {
            PhotoError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            PhotoError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            PhotoError::PreconditionFailed(msg) => (StatusCode::CONFLICT, msg.clone()),
            PhotoError::NetworkError(msg) => {
                error!("Upstream network error details: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "The photo search service could not be reached".to_string(),
                )
            }
            PhotoError::InvalidResponse(msg) => {
                error!("Upstream payload error details: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "The photo search service returned an unexpected response".to_string(),
                )
            }
            PhotoError::StorageError(msg) => {
                error!("Storage error details: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        }
    } else if err.find::<DeadlineExceeded>().is_some() {
        (
            StatusCode::GATEWAY_TIMEOUT,
            "The operation did not complete before the request deadline".to_string(),
        )
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            "The requested resource was not found".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "This method is not allowed for this endpoint".to_string(),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An internal error occurred".to_string(),
        )
    };

    let json = warp::reply::json(&ErrorResponse {
        code: code.as_u16(),
        message,
    });

    Ok(warp::reply::with_status(json, code))
}
