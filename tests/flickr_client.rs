use geo_photo_cache::flickr::{FlickrClient, FlickrSettings, PhotoSearch};
use geo_photo_cache::limiter::OutboundLimiter;
use geo_photo_cache::models::Coordinate;
use geo_photo_cache::PhotoError;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use url::Url;
use warp::http::StatusCode;
use warp::Filter;

type SeenQueries = Arc<Mutex<Vec<HashMap<String, String>>>>;

/// Serves a canned search API and a couple of image paths on an ephemeral port.
fn spawn_fake_service(search_body: serde_json::Value, search_status: StatusCode) -> (SocketAddr, SeenQueries) {
    let seen: SeenQueries = Arc::default();

    let search = {
        let seen = seen.clone();
        warp::path!("services" / "rest")
            .and(warp::get())
            .and(warp::query::<HashMap<String, String>>())
            .map(move |query: HashMap<String, String>| {
                seen.lock().unwrap().push(query);
                warp::reply::with_status(warp::reply::json(&search_body), search_status)
            })
    };

    let small_image = warp::path!("img" / "small.png")
        .map(|| warp::reply::with_header(vec![0x89u8, b'P', b'N', b'G'], "content-type", "image/png"));
    let large_image = warp::path!("img" / "large.jpg").map(|| vec![0u8; 4096]);
    let missing_image = warp::path!("img" / "missing.jpg")
        .map(|| warp::reply::with_status("gone", StatusCode::NOT_FOUND));
    let garbage = warp::path!("garbage" / "rest").map(|| "<html>maintenance</html>");

    let routes = search
        .or(small_image)
        .or(large_image)
        .or(missing_image)
        .or(garbage);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, seen)
}

fn client(endpoint: &str, max_image_bytes: usize) -> FlickrClient {
    FlickrClient::new(
        FlickrSettings {
            endpoint: Url::parse(endpoint).unwrap(),
            api_key: "secret-key".to_string(),
            safe_search: 1,
            max_image_bytes,
        },
        OutboundLimiter::unlimited(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_search_sends_expected_query_and_parses() {
    let body = json!({
        "photos": {
            "page": 3,
            "pages": 5,
            "perpage": 18,
            "photo": [
                {"id": "1", "owner": "x", "secret": "abc", "server": "3", "farm": 2, "title": "pier"},
                {"id": "7", "secret": "def", "server": "9", "farm": "4"}
            ]
        },
        "stat": "ok"
    });
    let (addr, seen) = spawn_fake_service(body, StatusCode::OK);
    let client = client(&format!("http://{}/services/rest", addr), 1024);

    let page = client
        .search(Coordinate::new(40.0, -74.0), 3, 18)
        .await
        .unwrap();

    assert_eq!(page.total_pages, 5);
    assert_eq!(page.page, 3);
    assert_eq!(page.photos.len(), 2);
    assert_eq!(page.photos[0].image_url, "https://farm2.staticflickr.com/3/1_abc.jpg");
    assert_eq!(page.photos[1].image_url, "https://farm4.staticflickr.com/9/7_def.jpg");

    let queries = seen.lock().unwrap();
    assert_eq!(queries.len(), 1);
    let query = &queries[0];
    assert_eq!(query["method"], "flickr.photos.search");
    assert_eq!(query["api_key"], "secret-key");
    assert_eq!(query["lat"], "40");
    assert_eq!(query["lon"], "-74");
    assert_eq!(query["format"], "json");
    assert_eq!(query["nojsoncallback"], "1");
    assert_eq!(query["safe_search"], "1");
    assert_eq!(query["page"], "3");
    assert_eq!(query["per_page"], "18");
}

#[tokio::test]
async fn test_search_api_failure_is_network_error() {
    let body = json!({"stat": "fail", "code": 100, "message": "Invalid API Key"});
    let (addr, _) = spawn_fake_service(body, StatusCode::OK);
    let client = client(&format!("http://{}/services/rest", addr), 1024);

    match client.search(Coordinate::new(1.0, 1.0), 1, 18).await {
        Err(PhotoError::NetworkError(msg)) => assert!(msg.contains("Invalid API Key")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_search_http_error_is_network_error() {
    let (addr, _) = spawn_fake_service(json!({}), StatusCode::SERVICE_UNAVAILABLE);
    let client = client(&format!("http://{}/services/rest", addr), 1024);

    assert!(matches!(
        client.search(Coordinate::new(1.0, 1.0), 1, 18).await,
        Err(PhotoError::NetworkError(_))
    ));
}

#[tokio::test]
async fn test_search_unparseable_body_is_invalid_response() {
    let (addr, _) = spawn_fake_service(json!({}), StatusCode::OK);

    let garbage = client(&format!("http://{}/garbage/rest", addr), 1024);
    assert!(matches!(
        garbage.search(Coordinate::new(1.0, 1.0), 1, 18).await,
        Err(PhotoError::InvalidResponse(_))
    ));

    let shapeless = client(&format!("http://{}/services/rest", addr), 1024);
    assert!(matches!(
        shapeless.search(Coordinate::new(1.0, 1.0), 1, 18).await,
        Err(PhotoError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_search_rejects_bad_arguments_without_calling_out() {
    let (addr, seen) = spawn_fake_service(json!({}), StatusCode::OK);
    let client = client(&format!("http://{}/services/rest", addr), 1024);
    let here = Coordinate::new(1.0, 1.0);

    assert!(matches!(client.search(here, 0, 18).await, Err(PhotoError::InvalidArgument(_))));
    assert!(matches!(client.search(here, 1, 0).await, Err(PhotoError::InvalidArgument(_))));
    assert!(matches!(client.search(here, 1, 501).await, Err(PhotoError::InvalidArgument(_))));
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_service_is_network_error() {
    // bind and drop a listener to get a port nobody is serving
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = client(&format!("http://127.0.0.1:{}/services/rest", port), 1024);

    assert!(matches!(
        client.search(Coordinate::new(1.0, 1.0), 1, 18).await,
        Err(PhotoError::NetworkError(_))
    ));
}

#[tokio::test]
async fn test_fetch_image_bytes() {
    let (addr, _) = spawn_fake_service(json!({}), StatusCode::OK);
    let client = client(&format!("http://{}/services/rest", addr), 1024);

    let bytes = client
        .fetch_image_bytes(&format!("http://{}/img/small.png", addr))
        .await
        .unwrap();
    assert_eq!(&bytes[..], &[0x89, b'P', b'N', b'G']);

    assert!(matches!(
        client
            .fetch_image_bytes(&format!("http://{}/img/missing.jpg", addr))
            .await,
        Err(PhotoError::NetworkError(_))
    ));

    assert!(matches!(
        client
            .fetch_image_bytes(&format!("http://{}/img/large.jpg", addr))
            .await,
        Err(PhotoError::InvalidResponse(_))
    ));

    assert!(matches!(
        client.fetch_image_bytes("ftp://example.com/a.jpg").await,
        Err(PhotoError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.fetch_image_bytes("not a url").await,
        Err(PhotoError::InvalidArgument(_))
    ));
}
