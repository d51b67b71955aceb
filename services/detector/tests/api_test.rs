//! Configuration API exercised through the router, without a listener.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use image::{ImageFormat, Rgb, RgbImage};
use parkwatch_detector::api::{create_router, AppState};
use parkwatch_detector::config::DetectorConfig;
use parkwatch_detector::{DefaultSourceFactory, Scheduler};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn create_test_app() -> (Router, Arc<Scheduler>) {
    let mut config = DetectorConfig::default();
    config.scheduler.target_fps = 50.0;
    config.scheduler.max_skip_factor = 0;
    let factory = DefaultSourceFactory::new(Duration::from_secs(1)).unwrap();
    let scheduler = Arc::new(Scheduler::new(&config, Arc::new(factory)));
    let state = AppState {
        scheduler: scheduler.clone(),
        service_name: "parkwatch-detector".to_string(),
    };
    (create_router(state, &config.api), scheduler)
}

fn create_test_lot(lot_id: u64, feed: &str) -> Value {
    json!({
        "lot_id": lot_id,
        "name": format!("Lot {lot_id}"),
        "location": "North campus",
        "video_feed_url": feed,
        "parking_spots": [
            {"id": 1, "x": 10, "y": 10},
            {"id": 2, "x": 150, "y": 10, "width": 80, "height": 40}
        ]
    })
}

fn striped_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, _| {
        if (x / 4) % 2 == 0 {
            Rgb([20, 20, 20])
        } else {
            Rgb([235, 235, 235])
        }
    });
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_pool_and_lots() {
    let (app, scheduler) = create_test_app();

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "parkwatch-detector");
    assert_eq!(body["active_lots"], 0);
    assert_eq!(body["max_workers"], 4);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_register_then_resubmit_is_unchanged() {
    let (app, scheduler) = create_test_app();
    let lot = create_test_lot(7, "stub://busy");

    let (status, body) = send(&app, Method::POST, "/config/parking-lot", Some(lot.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lot_id"], 7);
    assert_eq!(body["accepted"], true);
    assert_eq!(body["outcome"], "created");

    let (status, body) = send(&app, Method::POST, "/config/parking-lot", Some(lot)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unchanged");
    assert_eq!(scheduler.active_lots(), 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_register_rejects_invalid_requests() {
    let (app, scheduler) = create_test_app();

    let missing_feed = create_test_lot(1, "  ");
    let (status, body) = send(&app, Method::POST, "/config/parking-lot", Some(missing_feed)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let mut duplicate = create_test_lot(1, "stub://empty");
    duplicate["parking_spots"] = json!([{"id": 1, "x": 0, "y": 0}, {"id": 1, "x": 50, "y": 0}]);
    let (status, _) = send(&app, Method::POST, "/config/parking-lot", Some(duplicate)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unsupported = create_test_lot(1, "gopher://camera");
    let (status, body) = send(&app, Method::POST, "/config/parking-lot", Some(unsupported)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("gopher"));

    let mut misfit = create_test_lot(1, "stub://empty");
    misfit["frame_width"] = json!(100);
    misfit["frame_height"] = json!(100);
    let (status, _) = send(&app, Method::POST, "/config/parking-lot", Some(misfit)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Method::POST, "/config/parking-lot", Some(json!({"name": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    assert_eq!(scheduler.active_lots(), 0);
}

#[tokio::test]
async fn test_remove_unknown_lot_is_not_found() {
    let (app, scheduler) = create_test_app();

    let (status, body) = send(&app, Method::DELETE, "/config/parking-lot/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    send(&app, Method::POST, "/config/parking-lot", Some(create_test_lot(42, "stub://empty"))).await;
    let (status, body) = send(&app, Method::DELETE, "/config/parking-lot/42", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);

    let (status, _) = send(&app, Method::GET, "/status/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_status_lists_registered_lots() {
    let (app, scheduler) = create_test_app();
    send(&app, Method::POST, "/config/parking-lot", Some(create_test_lot(2, "stub://busy"))).await;
    send(&app, Method::POST, "/config/parking-lot", Some(create_test_lot(1, "stub://offline"))).await;

    let (status, body) = send(&app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["lot_id"], 1);
    assert_eq!(rows[1]["lot_id"], 2);
    assert_eq!(rows[1]["spot_count"], 2);

    let mut spots = Vec::new();
    for _ in 0..200 {
        let (_, body) = send(&app, Method::GET, "/status/2", None).await;
        spots = body["spots"].as_array().cloned().unwrap_or_default();
        if spots.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(spots.len(), 2);
    assert!(spots.iter().all(|s| s["occupied"] == true));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_single_image_classifies_without_registering() {
    let (app, scheduler) = create_test_app();
    let image = format!("data:image/png;base64,{}", STANDARD.encode(striped_png(320, 120)));

    let request = json!({
        "image_base64": image,
        "parking_spots": [{"id": 5, "x": 10, "y": 10}],
        "annotate": true
    });
    let (status, body) = send(&app, Method::POST, "/test/single-image", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["frame_width"], 320);
    assert_eq!(body["frame_height"], 120);
    assert_eq!(body["detections"][0]["id"], 5);
    assert_eq!(body["detections"][0]["occupied"], true);
    assert!(body["annotated_image"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
    assert_eq!(scheduler.active_lots(), 0);

    // Raising the threshold past the spot area flips the verdict
    let request = json!({
        "image_base64": STANDARD.encode(striped_png(320, 120)),
        "parking_spots": [{"id": 5, "x": 10, "y": 10}],
        "params": {"occupancy_pixel_threshold": 100000}
    });
    let (status, body) = send(&app, Method::POST, "/test/single-image", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["detections"][0]["occupied"], false);
    assert!(body.get("annotated_image").is_none());
}

#[tokio::test]
async fn test_single_image_rejects_bad_input() {
    let (app, _scheduler) = create_test_app();

    let request = json!({"image_base64": "not base64!!", "parking_spots": []});
    let (status, body) = send(&app, Method::POST, "/test/single-image", Some(request)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_IMAGE");

    let request = json!({
        "image_base64": STANDARD.encode(striped_png(64, 64)),
        "parking_spots": [{"id": 1, "x": 10, "y": 10}]
    });
    let (status, body) = send(&app, Method::POST, "/test/single-image", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("exceeds frame bounds"));
}

#[tokio::test]
async fn test_single_image_rejects_oversized_filters() {
    let (app, _scheduler) = create_test_app();
    let image = STANDARD.encode(striped_png(16, 16));

    for (field, value) in [
        ("median_kernel", 65537u32),
        ("block_size", 1_000_000),
        ("dilation_iterations", 100_000),
    ] {
        let request = json!({
            "image_base64": image,
            "parking_spots": [{"id": 1, "x": 0, "y": 0, "width": 8, "height": 8}],
            "params": {field: value}
        });
        let (status, body) = send(&app, Method::POST, "/test/single-image", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{field} was accepted");
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["error"].as_str().unwrap().contains(field));
    }
}
