use crate::coordinator::PhotoCacheCoordinator;
use crate::error::{handle_rejection, DeadlineExceeded, PhotoError, Result};
use crate::flickr::PhotoSearch;
use crate::middleware::{add_request_id_header, with_request_id};
use crate::models::{
    Coordinate, CoordinateQuery, DeletePhotosRequest, PhotoImageQuery, PhotosResponse,
};
use crate::store::LocationPhotoIndex;
use image::ImageFormat;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub type SharedCoordinator<I, S> = Arc<PhotoCacheCoordinator<I, S>>;

/// Runs a coordinator operation under the request deadline. Hitting the
/// deadline stops waiting; a write already under way still lands whole.
async fn run<T>(
    request_id: &str,
    operation: &'static str,
    deadline: Duration,
    op: impl Future<Output = Result<T>>,
) -> Result<T, Rejection> {
    match tokio::time::timeout(deadline, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            match &e {
                PhotoError::NotFound(_)
                | PhotoError::InvalidArgument(_)
                | PhotoError::PreconditionFailed(_) => {
                    warn!(request_id = %request_id, operation, error = %e, "Request rejected");
                }
                _ => {
                    error!(request_id = %request_id, operation, error = %e, "Operation failed");
                }
            }
            Err(warp::reject::custom(e))
        }
        Err(_) => {
            error!(request_id = %request_id, operation, ?deadline, "Deadline exceeded");
            Err(warp::reject::custom(DeadlineExceeded))
        }
    }
}

pub async fn list_pins_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    let pins = run(&request_id, "list_pins", deadline, coordinator.list_pins()).await?;
    info!(request_id = %request_id, "Listed {} pins", pins.len());
    Ok(add_request_id_header(warp::reply::json(&pins), &request_id))
}

pub async fn add_pin_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    body: Coordinate,
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    let location = run(&request_id, "add_pin", deadline, coordinator.add_pin(body)).await?;
    Ok(add_request_id_header(
        warp::reply::with_status(warp::reply::json(&location), StatusCode::CREATED),
        &request_id,
    ))
}

pub async fn remove_pin_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    query: CoordinateQuery,
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    let coordinate = Coordinate::from(query);
    run(
        &request_id,
        "remove_pin",
        deadline,
        coordinator.remove_pin(coordinate),
    )
    .await?;
    Ok(add_request_id_header(
        warp::reply::json(&json!({
            "message": format!("Pin at {} was removed", coordinate)
        })),
        &request_id,
    ))
}

pub async fn load_photos_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    query: CoordinateQuery,
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    let coordinate = Coordinate::from(query);
    let photos = run(
        &request_id,
        "load_photos",
        deadline,
        coordinator.load_photos(coordinate),
    )
    .await?;
    Ok(add_request_id_header(
        warp::reply::json(&PhotosResponse::new(coordinate, &photos)),
        &request_id,
    ))
}

pub async fn refresh_collection_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    query: CoordinateQuery,
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    let coordinate = Coordinate::from(query);
    let photos = run(
        &request_id,
        "refresh_collection",
        deadline,
        coordinator.refresh_collection(coordinate),
    )
    .await?;
    Ok(add_request_id_header(
        warp::reply::json(&PhotosResponse::new(coordinate, &photos)),
        &request_id,
    ))
}

pub async fn prefetch_images_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    query: CoordinateQuery,
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    let coordinate = Coordinate::from(query);
    let report = run(
        &request_id,
        "prefetch_images",
        deadline,
        coordinator.prefetch_images(coordinate),
    )
    .await?;
    Ok(add_request_id_header(warp::reply::json(&report), &request_id))
}

pub async fn delete_photos_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    query: CoordinateQuery,
    body: DeletePhotosRequest,
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    if body.ids.is_empty() {
        return Err(warp::reject::custom(PhotoError::InvalidArgument(
            "at least one photo id is required".to_string(),
        )));
    }

    let coordinate = Coordinate::from(query);
    let remaining = run(
        &request_id,
        "delete_photos",
        deadline,
        coordinator.delete_photos(coordinate, body.ids),
    )
    .await?;
    Ok(add_request_id_header(
        warp::reply::json(&PhotosResponse::new(coordinate, &remaining)),
        &request_id,
    ))
}

pub async fn photo_image_handler<I: LocationPhotoIndex, S: PhotoSearch>(
    query: PhotoImageQuery,
    request_id: String,
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> Result<impl Reply, Rejection> {
    let coordinate = Coordinate::new(query.lat, query.lon);
    let bytes = run(
        &request_id,
        "photo_image",
        deadline,
        coordinator.photo_image(coordinate, query.id),
    )
    .await?;

    let content_type = match image::guess_format(&bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Bmp) => "image/bmp",
        _ => "application/octet-stream",
    };

    Ok(add_request_id_header(
        warp::reply::with_header(bytes, "content-type", content_type),
        &request_id,
    ))
}

/// The full HTTP surface, with rejections rendered as JSON errors.
pub fn routes<I: LocationPhotoIndex, S: PhotoSearch>(
    coordinator: SharedCoordinator<I, S>,
    deadline: Duration,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let ctx = with_request_id()
        .and(warp::any().map(move || coordinator.clone()))
        .and(warp::any().map(move || deadline));

    let list_pins = warp::path!("pins")
        .and(warp::get())
        .and(ctx.clone())
        .and_then(list_pins_handler::<I, S>);

    let add_pin = warp::path!("pins")
        .and(warp::post())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(add_pin_handler::<I, S>);

    let remove_pin = warp::path!("pins")
        .and(warp::delete())
        .and(warp::query::<CoordinateQuery>())
        .and(ctx.clone())
        .and_then(remove_pin_handler::<I, S>);

    let load_photos = warp::path!("photos")
        .and(warp::get())
        .and(warp::query::<CoordinateQuery>())
        .and(ctx.clone())
        .and_then(load_photos_handler::<I, S>);

    let refresh = warp::path!("photos" / "refresh")
        .and(warp::post())
        .and(warp::query::<CoordinateQuery>())
        .and(ctx.clone())
        .and_then(refresh_collection_handler::<I, S>);

    let prefetch = warp::path!("photos" / "prefetch")
        .and(warp::post())
        .and(warp::query::<CoordinateQuery>())
        .and(ctx.clone())
        .and_then(prefetch_images_handler::<I, S>);

    let delete_photos = warp::path!("photos")
        .and(warp::delete())
        .and(warp::query::<CoordinateQuery>())
        .and(warp::body::json())
        .and(ctx.clone())
        .and_then(delete_photos_handler::<I, S>);

    let photo_image = warp::path!("photos" / "image")
        .and(warp::get())
        .and(warp::query::<PhotoImageQuery>())
        .and(ctx)
        .and_then(photo_image_handler::<I, S>);

    list_pins
        .or(add_pin)
        .or(remove_pin)
        .or(load_photos)
        .or(refresh)
        .or(prefetch)
        .or(delete_photos)
        .or(photo_image)
        .recover(handle_rejection)
}
