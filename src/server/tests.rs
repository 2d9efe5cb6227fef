use super::server::PresenceServerBuilder;
use crate::{
    config::{DetectorKind, PresenceConfig, StorageConfig},
    detector::StaticDetector,
    frame::Frame,
    service::PresenceService,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use image::{Rgb, RgbImage};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "presencecam-test-boundary";

fn test_router(dir: &TempDir, presence: bool) -> Router {
    let mut config = PresenceConfig::default();
    config.detector.kind = DetectorKind::Static;
    config.storage = StorageConfig::rooted_at(dir.path());

    let service = PresenceService::with_detector(
        &config,
        Arc::new(StaticDetector::new("YOLOv8", presence)),
    )
    .unwrap();

    PresenceServerBuilder::new()
        .config(config.server.clone())
        .service(Arc::new(service))
        .build()
        .unwrap()
        .router()
}

fn jpeg_like_upload() -> Vec<u8> {
    let img = RgbImage::from_fn(32, 24, |x, y| Rgb([x as u8 * 8, y as u8 * 10, 90]));
    Frame::from_rgb(img).unwrap().raw.to_vec()
}

fn multipart(field: &str, filename: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
            BOUNDARY, field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[test]
fn test_builder_requires_service() {
    let result = PresenceServerBuilder::new()
        .config(PresenceConfig::default().server)
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_index_names_method() {
    let dir = TempDir::new().unwrap();
    let response = test_router(&dir, true).oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("YOLOv8"));
}

#[tokio::test]
async fn test_upload_detects_presence() {
    let dir = TempDir::new().unwrap();
    let app = test_router(&dir, true);

    let response = app
        .clone()
        .oneshot(multipart("imageFile", "frame.png", &jpeg_like_upload()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Presence Detected");

    let status = app.clone().oneshot(get("/status")).await.unwrap();
    assert_eq!(body_text(status).await, "1");

    let history = app.oneshot(get("/history")).await.unwrap();
    assert_eq!(history.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_text(history).await).unwrap();
    let records = json["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);

    let row = records[0].as_array().unwrap();
    assert!(row[0].as_str().unwrap().ends_with("_presence_1.jpg"));
    assert_eq!(row[1], 1);
    assert_eq!(row[2], 0);
    assert_eq!(row[3], "YOLOv8");
    assert_eq!(row[5], 1);
}

#[tokio::test]
async fn test_upload_without_presence() {
    let dir = TempDir::new().unwrap();
    let response = test_router(&dir, false)
        .oneshot(multipart("imageFile", "frame.png", &jpeg_like_upload()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "No Presence Detected");
}

#[tokio::test]
async fn test_upload_input_errors() {
    let dir = TempDir::new().unwrap();
    let app = test_router(&dir, true);

    let missing = app
        .clone()
        .oneshot(multipart("photo", "frame.png", &jpeg_like_upload()))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(missing).await, "No file part");

    let unnamed = app
        .clone()
        .oneshot(multipart("imageFile", "", &jpeg_like_upload()))
        .await
        .unwrap();
    assert_eq!(unnamed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(unnamed).await, "No selected file");

    let garbage = app
        .clone()
        .oneshot(multipart("imageFile", "frame.jpg", b"not an image at all"))
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(garbage).await, "Invalid image");

    // nothing was recorded
    let history = app.oneshot(get("/history")).await.unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_text(history).await).unwrap();
    assert!(json["records"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_history_filters_by_method() {
    let dir = TempDir::new().unwrap();
    let app = test_router(&dir, true);

    for _ in 0..3 {
        app.clone()
            .oneshot(multipart("imageFile", "frame.png", &jpeg_like_upload()))
            .await
            .unwrap();
    }

    let history = app
        .clone()
        .oneshot(get("/history?method=YOLOv8&limit=2"))
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_text(history).await).unwrap();
    let tries: Vec<_> = json["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row[5].as_i64().unwrap())
        .collect();
    assert_eq!(tries, vec![3, 2]);

    let other = app
        .oneshot(get("/history?method=Fallback%20(YOLOv8)"))
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&body_text(other).await).unwrap();
    assert!(json["records"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_health_reports_service() {
    let dir = TempDir::new().unwrap();
    let response = test_router(&dir, true).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["method"], "YOLOv8");
    assert_eq!(json["fallback"]["enabled"], false);
    assert_eq!(json["events_recorded"], 0);
}
