use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::GenericImageView;
use image::imageops::FilterType;
use serde_json::{Value, json};
use url::Url;

use crate::config::RemoteConfig;

/// Largest image the remote service accepts without rejection. Anything
/// bigger is downscaled proportionally before submission.
pub const MAX_IMAGE_WIDTH: u32 = 1152;
pub const MAX_IMAGE_HEIGHT: u32 = 2048;

#[derive(Debug, Clone)]
pub enum ImagePayload {
    Base64(String),
    Url(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("unsupported or empty image payload")]
    InvalidPayload,
    #[error("invalid inference endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
    #[error("authentication rejected ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("workflow or workspace not found ({status}): {body}")]
    NotFound { status: u16, body: String },
    #[error("unprocessable request ({status}): {body}")]
    UnprocessableEntity { status: u16, body: String },
    #[error("inference server error ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("unexpected response status ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Thin HTTP client for the remote vision-inference workflow API.
///
/// Submits one image per call and hands the parsed response back untouched;
/// the response schema is opaque here, normalization happens downstream.
/// Never retries; a failed photo is isolated by the caller, not retried.
#[derive(Clone, Debug)]
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl InferenceClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, InferenceError> {
        let mut base_url = Url::parse(&config.api_url)
            .map_err(|e| InferenceError::InvalidEndpoint(config.api_url.clone(), e.to_string()))?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    /// Runs the named workflow against one image and returns the parsed
    /// response body unchanged.
    pub async fn run_workflow(
        &self,
        workspace: &str,
        workflow_id: &str,
        image_path: &Path,
        payload: ImagePayload,
    ) -> Result<Value, InferenceError> {
        let payload = self.prepare_payload(image_path, payload);

        let image_input = match &payload {
            ImagePayload::Base64(value) if !value.is_empty() => {
                json!({"type": "base64", "value": value})
            }
            ImagePayload::Url(value) if !value.is_empty() => {
                json!({"type": "url", "value": value})
            }
            _ => {
                log::error!(
                    "empty image payload for {}, refusing to call workflow {workflow_id}",
                    image_path.display()
                );
                return Err(InferenceError::InvalidPayload);
            }
        };

        let url = self
            .base_url
            .join(&format!("infer/workflows/{workspace}/{workflow_id}"))
            .map_err(|e| {
                InferenceError::InvalidEndpoint(self.base_url.to_string(), e.to_string())
            })?;
        let body = json!({
            "api_key": self.api_key,
            "inputs": {"image": image_input},
        });

        log::info!(
            "Submitting workflow {workflow_id} for image {}",
            image_path.display()
        );
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| InferenceError::Transport(e.to_string()));
        }

        let code = status.as_u16();
        let body_text = response.text().await.unwrap_or_default();
        log::error!("workflow {workflow_id} returned {code}: {body_text}");
        Err(match code {
            401 | 403 => InferenceError::Auth { status: code, body: body_text },
            404 => InferenceError::NotFound { status: code, body: body_text },
            422 => InferenceError::UnprocessableEntity { status: code, body: body_text },
            c if c >= 500 => InferenceError::Server { status: code, body: body_text },
            _ => InferenceError::Http { status: code, body: body_text },
        })
    }

    /// Swaps an inline payload for a downscaled re-encode when the local
    /// file exceeds the service's size ceiling. Downscaling failures keep
    /// the original payload.
    fn prepare_payload(&self, image_path: &Path, payload: ImagePayload) -> ImagePayload {
        if !matches!(payload, ImagePayload::Base64(_)) {
            return payload;
        }
        if !image_path.exists() {
            log::warn!(
                "inline payload without a readable local file: {}",
                image_path.display()
            );
            return payload;
        }
        match downscale_oversized(image_path) {
            Ok(Some(encoded)) => {
                log::info!("submitting downscaled copy of {}", image_path.display());
                ImagePayload::Base64(encoded)
            }
            Ok(None) => payload,
            Err(e) => {
                log::error!(
                    "failed to downscale {}: {e}; submitting original payload",
                    image_path.display()
                );
                payload
            }
        }
    }
}

fn downscale_oversized(path: &Path) -> Result<Option<String>, image::ImageError> {
    let img = image::open(path)?;
    let (width, height) = img.dimensions();
    if width <= MAX_IMAGE_WIDTH && height <= MAX_IMAGE_HEIGHT {
        return Ok(None);
    }

    let ratio = f64::min(
        MAX_IMAGE_WIDTH as f64 / width as f64,
        MAX_IMAGE_HEIGHT as f64 / height as f64,
    );
    let new_width = (width as f64 * ratio) as u32;
    let new_height = (height as f64 * ratio) as u32;
    log::info!("downscaling {width}x{height} image to {new_width}x{new_height}");

    let resized = img.resize_exact(new_width, new_height, FilterType::Lanczos3);
    let rgb = image::DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut buffer = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Jpeg)?;
    Ok(Some(BASE64.encode(&buffer)))
}
