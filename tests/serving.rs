//! End-to-end tests against the real router on an ephemeral port.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fashion_serving::config::{self, AppConfig};
use fashion_serving::error::InferenceError;
use fashion_serving::models::{Classifier, ModelLoader, ScoreableModel};
use fashion_serving::server::{self, AppState};
use fashion_serving::types::InputTensor;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value;

/// Mean intensity selects the category bucket
struct IntensityModel {
    classes: usize,
}

impl ScoreableModel for IntensityModel {
    fn name(&self) -> &str {
        "intensity-fixture"
    }

    fn forward(&self, tensor: &InputTensor) -> Result<Vec<f32>, InferenceError> {
        let bucket = ((tensor.mean() * self.classes as f32) as usize).min(self.classes - 1);
        Ok((0..self.classes)
            .map(|i| if i == bucket { 3.0 } else { 0.0 })
            .collect())
    }
}

/// Sleeps in every forward pass and tracks how many run at once
struct SlowModel {
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowModel {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl ScoreableModel for SlowModel {
    fn name(&self) -> &str {
        "slow-fixture"
    }

    fn forward(&self, _tensor: &InputTensor) -> Result<Vec<f32>, InferenceError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![0.0, 0.0, 1.0, 0.0, 0.0])
    }
}

fn gray_png(level: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(28, 28, Rgb([level, level, level]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Gray level for the "sneaker" bucket (index 2 of 5)
const SNEAKER_GRAY: u8 = 128;

async fn spawn(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(state)).await.unwrap();
    });
    addr
}

fn ready_state(config: AppConfig) -> Arc<AppState> {
    ready_state_with(config, Arc::new(IntensityModel { classes: 5 }))
}

fn ready_state_with(config: AppConfig, model: Arc<dyn ScoreableModel>) -> Arc<AppState> {
    let state = Arc::new(AppState::new(config));
    let classifier = Classifier::from_config(model, &state.config, state.recorder.clone());
    assert!(state.mark_ready(classifier));
    state
}

fn upload(bytes: Vec<u8>, filename: &str, mime: &str) -> Form {
    Form::new().part(
        "image_data",
        Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .unwrap(),
    )
}

#[tokio::test]
async fn test_predict_sneaker() {
    let addr = spawn(ready_state(config::defaults())).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(upload(gray_png(SNEAKER_GRAY), "0.png", "image/png"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["label"], "sneaker");
    assert_eq!(body["filename"], "0.png");
    let confidence = body["confidence"].as_f64().unwrap();
    assert!(confidence > 0.0 && confidence <= 1.0);
}

#[tokio::test]
async fn test_predict_accepts_file_field() {
    let addr = spawn(ready_state(config::defaults())).await;

    let form = Form::new().part(
        "file",
        Part::bytes(gray_png(230)).file_name("trouser.png".to_string()),
    );
    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["label"], "trouser");
}

#[tokio::test]
async fn test_text_upload_is_bad_request() {
    let addr = spawn(ready_state(config::defaults())).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(upload(
            b"name,price\nsneaker,59.99\n".to_vec(),
            "notes.txt",
            "text/plain",
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "invalid_input");
    assert!(body["detail"].as_str().unwrap().contains("text/plain"));
}

#[tokio::test]
async fn test_missing_file_field_is_bad_request() {
    let addr = spawn(ready_state(config::defaults())).await;

    let form = Form::new().text("comment", "no image here");
    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "missing_file");
}

#[tokio::test]
async fn test_non_multipart_body_is_bad_request() {
    let addr = spawn(ready_state(config::defaults())).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .body(gray_png(SNEAKER_GRAY))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "invalid_multipart");
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let mut config = config::defaults();
    config.server.max_upload_bytes = 1024;
    let addr = spawn(ready_state(config)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(upload(vec![0u8; 16 * 1024], "big.png", "image/png"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "payload_too_large");
}

#[tokio::test]
async fn test_failed_load_reports_unavailable() {
    let mut config = config::defaults();
    config.model.location = Some("/nonexistent/models/fashion.onnx".to_string());
    let state = Arc::new(AppState::new(config));
    let addr = spawn(state.clone()).await;

    let loader = ModelLoader::new(&state.config.model);
    assert!(server::initialize(&state, &loader).await.is_err());

    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "failed");
    assert!(body["detail"].as_str().unwrap().contains("model_unreachable"));

    let predict = client
        .post(format!("http://{}/predict", addr))
        .multipart(upload(gray_png(SNEAKER_GRAY), "0.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(predict.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = predict.json().await.unwrap();
    assert_eq!(body["type"], "model_unavailable");

    let metrics = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("model_ready 0"));
}

#[tokio::test]
async fn test_initializing_state_answers_unavailable() {
    let addr = spawn(Arc::new(AppState::new(config::defaults()))).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "initializing");

    let predict = client
        .post(format!("http://{}/predict", addr))
        .multipart(upload(gray_png(SNEAKER_GRAY), "0.png", "image/png"))
        .send()
        .await
        .unwrap();
    assert_eq!(predict.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_and_ping_when_ready() {
    let addr = spawn(ready_state(config::defaults())).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["model"], "intensity-fixture");

    let ping = client
        .get(format!("http://{}/ping", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(ping, "pong");
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_labels() {
    let addr = spawn(ready_state(config::defaults())).await;
    let client = reqwest::Client::new();
    let categories = config::default_categories();
    let levels = [25u8, 76, 128, 178, 230];

    let requests = (0..25).map(|i| {
        let client = client.clone();
        let index = i % levels.len();
        let bytes = gray_png(levels[index]);
        async move {
            let response = client
                .post(format!("http://{}/predict", addr))
                .multipart(upload(bytes, &format!("{}.png", i), "image/png"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body: Value = response.json().await.unwrap();
            (index, body["label"].as_str().unwrap().to_string())
        }
    });

    for (index, label) in futures::future::join_all(requests).await {
        assert_eq!(label, categories[index]);
    }
}

#[tokio::test]
async fn test_metrics_reflect_requests() {
    let addr = spawn(ready_state(config::defaults())).await;
    let client = reqwest::Client::new();

    for (bytes, name, mime) in [
        (gray_png(SNEAKER_GRAY), "a.png", "image/png"),
        (gray_png(SNEAKER_GRAY), "b.png", "image/png"),
        (b"not an image".to_vec(), "c.txt", "text/plain"),
    ] {
        client
            .post(format!("http://{}/predict", addr))
            .multipart(upload(bytes, name, mime))
            .send()
            .await
            .unwrap();
    }

    let response = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let text = response.text().await.unwrap();
    assert!(text.contains("inference_requests_total{outcome=\"success\"} 2"));
    assert!(text.contains("inference_requests_total{outcome=\"client_error\"} 1"));
    assert!(text.contains("predictions_total{label=\"sneaker\",outcome=\"success\"} 2"));
    assert!(text.contains("predictions_total{label=\"none\",outcome=\"client_error\"} 1"));
    assert!(text.contains("model_ready 1"));
    assert!(text.contains("metrics_sink_errors_total 0"));
}

#[tokio::test]
async fn test_named_field_wins_over_earlier_file_part() {
    let addr = spawn(ready_state(config::defaults())).await;

    let form = Form::new()
        .part(
            "thumbnail",
            Part::bytes(gray_png(25)).file_name("thumb.png".to_string()),
        )
        .part(
            "image_data",
            Part::bytes(gray_png(SNEAKER_GRAY)).file_name("full.png".to_string()),
        );
    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["label"], "sneaker");
    assert_eq!(body["filename"], "full.png");
}

#[tokio::test]
async fn test_unnamed_file_part_is_the_fallback() {
    let addr = spawn(ready_state(config::defaults())).await;

    let form = Form::new().text("comment", "front view").part(
        "upload",
        Part::bytes(gray_png(76)).file_name("shirt.png".to_string()),
    );
    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["label"], "shirt");
}

#[tokio::test]
async fn test_slow_inference_times_out_with_error_body() {
    let mut config = config::defaults();
    config.server.request_timeout_secs = 1;
    let model = Arc::new(SlowModel::new(Duration::from_millis(1500)));
    let addr = spawn(ready_state_with(config, model)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/predict", addr))
        .multipart(upload(gray_png(SNEAKER_GRAY), "0.png", "image/png"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "request_timeout");
    assert!(body["detail"].as_str().unwrap().contains("1s"));
}

#[tokio::test]
async fn test_timed_out_requests_keep_the_inference_bound() {
    let mut config = config::defaults();
    config.server.request_timeout_secs = 1;
    config.server.max_concurrent_inferences = 1;
    let model = Arc::new(SlowModel::new(Duration::from_millis(1500)));
    let addr = spawn(ready_state_with(config, model.clone())).await;
    let client = reqwest::Client::new();

    let requests = (0..3u64).map(|i| {
        let client = client.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(1100 * i)).await;
            client
                .post(format!("http://{}/predict", addr))
                .multipart(upload(gray_png(SNEAKER_GRAY), "0.png", "image/png"))
                .send()
                .await
                .unwrap()
                .status()
        }
    });

    for status in futures::future::join_all(requests).await {
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    }
    assert_eq!(model.peak.load(Ordering::SeqCst), 1);
}
