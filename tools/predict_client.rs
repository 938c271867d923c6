//! Test Prediction Client
//!
//! Uploads images to a running server's `/predict` endpoint and reports the
//! label distribution and latency. Without `--image`, random grayscale
//! images are generated.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "predict-client", about = "Send test images to the fashion classifier")]
struct Args {
    /// Base URL of the server
    #[arg(long, default_value = "http://localhost:8080")]
    url: String,

    /// Image files to upload; cycled through until `count` requests are sent
    #[arg(long)]
    image: Vec<PathBuf>,

    /// Number of requests
    #[arg(long, default_value_t = 100)]
    count: usize,

    /// Requests in flight at once
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Side length of generated images
    #[arg(long, default_value_t = 28)]
    size: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    label: String,
    confidence: f32,
}

struct Upload {
    filename: String,
    bytes: Vec<u8>,
}

/// Outcome of one request
enum Reply {
    Ok(Prediction),
    Rejected(u16, String),
    Failed(String),
}

/// Random image generator for testing
struct ImageGenerator {
    rng: rand::rngs::ThreadRng,
    size: u32,
    counter: u64,
}

impl ImageGenerator {
    fn new(size: u32) -> Self {
        Self {
            rng: rand::thread_rng(),
            size,
            counter: 0,
        }
    }

    /// Uniform background with noise around a random base level
    fn generate(&mut self) -> Result<Upload> {
        self.counter += 1;
        let base: i16 = self.rng.gen_range(0..=255);
        let mut img = GrayImage::new(self.size, self.size);
        for pixel in img.pixels_mut() {
            let noisy = base + self.rng.gen_range(-20..=20);
            *pixel = Luma([noisy.clamp(0, 255) as u8]);
        }

        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img).write_to(&mut buf, ImageFormat::Png)?;
        Ok(Upload {
            filename: format!("generated_{:06}.png", self.counter),
            bytes: buf.into_inner(),
        })
    }
}

async fn load_uploads(args: &Args) -> Result<Vec<Upload>> {
    if args.image.is_empty() {
        let mut generator = ImageGenerator::new(args.size);
        return (0..args.count).map(|_| generator.generate()).collect();
    }

    let mut files = Vec::with_capacity(args.image.len());
    for path in &args.image {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        files.push(Upload { filename, bytes });
    }

    Ok((0..args.count)
        .map(|i| {
            let file = &files[i % files.len()];
            Upload {
                filename: file.filename.clone(),
                bytes: file.bytes.clone(),
            }
        })
        .collect())
}

async fn send(client: &reqwest::Client, endpoint: &str, upload: Upload) -> (Duration, Reply) {
    let start = Instant::now();
    let part = reqwest::multipart::Part::bytes(upload.bytes).file_name(upload.filename);
    let form = reqwest::multipart::Form::new().part("image_data", part);

    let reply = match client.post(endpoint).multipart(form).send().await {
        Ok(response) if response.status().is_success() => match response.json().await {
            Ok(prediction) => Reply::Ok(prediction),
            Err(e) => Reply::Failed(e.to_string()),
        },
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Reply::Rejected(status, body)
        }
        Err(e) => Reply::Failed(e.to_string()),
    };
    (start.elapsed(), reply)
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("predict_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let endpoint = format!("{}/predict", args.url.trim_end_matches('/'));

    info!(
        endpoint = %endpoint,
        count = args.count,
        concurrency = args.concurrency,
        files = args.image.len(),
        "Configuration loaded"
    );

    let uploads = load_uploads(&args).await?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()?;

    let started = Instant::now();
    let results: Vec<(Duration, Reply)> = stream::iter(uploads)
        .map(|upload| send(&client, &endpoint, upload))
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;
    let wall = started.elapsed();

    let mut labels: BTreeMap<String, usize> = BTreeMap::new();
    let mut confidence_sum = 0.0f64;
    let mut rejected = 0usize;
    let mut failed = 0usize;
    let mut latencies = Vec::with_capacity(results.len());

    for (i, (latency, reply)) in results.into_iter().enumerate() {
        latencies.push(latency);
        match reply {
            Reply::Ok(prediction) => {
                confidence_sum += f64::from(prediction.confidence);
                *labels.entry(prediction.label).or_default() += 1;
            }
            Reply::Rejected(status, body) => {
                rejected += 1;
                if rejected <= 3 {
                    warn!(request = i, status = status, body = %body, "Request rejected");
                }
            }
            Reply::Failed(error) => {
                failed += 1;
                if failed <= 3 {
                    warn!(request = i, error = %error, "Request failed");
                }
            }
        }
    }

    latencies.sort();
    let succeeded: usize = labels.values().sum();
    let mean_confidence = if succeeded > 0 {
        confidence_sum / succeeded as f64
    } else {
        0.0
    };

    for (label, count) in &labels {
        info!(label = %label, count = count, "Label distribution");
    }
    info!(
        succeeded = succeeded,
        rejected = rejected,
        failed = failed,
        mean_confidence = mean_confidence,
        p50_ms = percentile(&latencies, 0.50).as_secs_f64() * 1000.0,
        p95_ms = percentile(&latencies, 0.95).as_secs_f64() * 1000.0,
        p99_ms = percentile(&latencies, 0.99).as_secs_f64() * 1000.0,
        throughput_rps = latencies.len() as f64 / wall.as_secs_f64().max(1e-9),
        "Completed"
    );

    Ok(())
}
