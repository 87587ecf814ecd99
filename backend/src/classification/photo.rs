use std::path::Path;
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::GenericImageView;
use shared::{PhotoResult, PhotoStatus};

use crate::classification::annotate;
use crate::config::RemoteConfig;
use crate::inference::client::{ImagePayload, InferenceClient};
use crate::inference::normalizer::{self, round2, ArtifactKind, DecodedArtifact};
use crate::storage::asset_service::AssetService;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp"];

pub fn is_image_file(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Per-photo failure, ordered by the stage that raised it. Mutually
/// exclusive: the first failing stage decides the status tag.
#[derive(Debug)]
enum PhotoError {
    File(String),
    Format(String),
    Api(String),
    Unexpected(String),
}

impl PhotoError {
    fn status(&self) -> PhotoStatus {
        match self {
            Self::File(_) => PhotoStatus::FileError,
            Self::Format(_) => PhotoStatus::FormatError,
            Self::Api(_) => PhotoStatus::ApiError,
            Self::Unexpected(_) => PhotoStatus::UnexpectedError,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::File(m) | Self::Format(m) | Self::Api(m) | Self::Unexpected(m) => m,
        }
    }
}

/// Processes one photo end to end: validation, inference, normalization,
/// count reconciliation and artifact persistence. Never fails outward:
/// every error path lands in the returned `PhotoResult`.
pub async fn process_photo(
    index: usize,
    photo_path: &Path,
    client: Option<&InferenceClient>,
    config: &RemoteConfig,
    storage: &AssetService,
    delivery_dir: &Path,
) -> PhotoResult {
    let started = Instant::now();
    let filename = photo_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut result = PhotoResult::pending(index, filename, photo_path.display().to_string());
    result.original_rel_path = storage.relative_to_root(photo_path);

    match run_stages(&mut result, photo_path, client, config, storage, delivery_dir).await {
        Ok(()) => result.status = PhotoStatus::Ok,
        Err(err) => {
            log::error!("photo {} ({}) failed: {}", index, result.filename, err.message());
            result.status = err.status();
            result.error_message = Some(err.message().to_string());
            result.error_trace = Some(format!("{err:?}"));
        }
    }

    result.elapsed_seconds = round2(started.elapsed().as_secs_f64());
    log::info!(
        "photo {} finished with status '{}' in {:.2}s",
        index,
        result.status,
        result.elapsed_seconds
    );
    result
}

async fn run_stages(
    result: &mut PhotoResult,
    photo_path: &Path,
    client: Option<&InferenceClient>,
    config: &RemoteConfig,
    storage: &AssetService,
    delivery_dir: &Path,
) -> Result<(), PhotoError> {
    if !photo_path.exists() {
        return Err(PhotoError::File(format!(
            "file not found: {}",
            photo_path.display()
        )));
    }
    if !is_image_file(&result.filename) {
        return Err(PhotoError::Format(format!(
            "'{}' is not a recognized image file",
            result.filename
        )));
    }
    let decoded = image::open(photo_path)
        .map_err(|e| PhotoError::Format(format!("failed to open image: {e}")))?;
    let (image_width, image_height) = decoded.dimensions();
    drop(decoded);

    let client = client.ok_or_else(|| {
        PhotoError::Api("inference client not initialized".to_string())
    })?;

    let bytes = std::fs::read(photo_path)
        .map_err(|e| PhotoError::Unexpected(format!("failed to read image file: {e}")))?;
    let payload = ImagePayload::Base64(BASE64.encode(&bytes));

    let api_started = Instant::now();
    let raw = client
        .run_workflow(&config.workspace, &config.workflow_id, photo_path, payload)
        .await
        .map_err(|e| PhotoError::Api(e.to_string()))?;
    log::info!(
        "inference for photo {} answered in {:.2}s",
        result.index,
        api_started.elapsed().as_secs_f64()
    );

    let normalized = normalizer::normalize(&raw, image_width, image_height);
    let (categories, breakdown_total) = normalized.category_breakdown();
    result.total_bunches = normalized.resolved_total(breakdown_total);
    result.service_total = normalized.service_total;
    result.categories = categories;
    result.direct_counts = normalized.direct_counts.clone();
    result.detections = normalized.detections.clone();

    persist_service_artifacts(result, &normalized.artifacts, storage, delivery_dir);

    // Local fallback render, only when the service supplied no image at all.
    if result.classified_rel_path.is_none()
        && result.label_viz_rel_path.is_none()
        && !result.detections.is_empty()
    {
        let annotated_name = format!("{}_annotated.jpg", file_stem(&result.filename));
        match annotate::render_annotated_image(photo_path, &result.detections) {
            Ok(bytes) => match storage.write_asset(delivery_dir, &annotated_name, &bytes) {
                Ok(rel) => result.annotated_rel_path = Some(rel),
                Err(e) => log::error!("could not store annotated image {annotated_name}: {e}"),
            },
            Err(e) => log::error!("could not render annotated image for photo {}: {e}", result.index),
        }
    }

    Ok(())
}

fn persist_service_artifacts(
    result: &mut PhotoResult,
    artifacts: &[DecodedArtifact],
    storage: &AssetService,
    delivery_dir: &Path,
) {
    let stem = file_stem(&result.filename);
    for artifact in artifacts {
        let artifact_name = format!("{stem}{}", artifact.kind.file_suffix());
        match storage.write_asset(delivery_dir, &artifact_name, &artifact.bytes) {
            Ok(rel) => {
                log::info!("stored service artifact {artifact_name}");
                match artifact.kind {
                    ArtifactKind::Classified => result.classified_rel_path = Some(rel),
                    ArtifactKind::LabelVisualization => result.label_viz_rel_path = Some(rel),
                }
            }
            Err(e) => log::error!("could not store service artifact {artifact_name}: {e}"),
        }
    }
}

fn file_stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::tempdir;

    fn test_config() -> RemoteConfig {
        RemoteConfig {
            api_url: "https://detect.example.com".to_string(),
            api_key: "k".to_string(),
            workspace: "ws".to_string(),
            project: "p".to_string(),
            workflow_id: "wf".to_string(),
            timeout_secs: 5,
        }
    }

    fn test_storage() -> (tempfile::TempDir, AssetService) {
        let dir = tempdir().unwrap();
        let storage = AssetService::new(dir.path().join("static")).unwrap();
        (dir, storage)
    }

    #[test]
    fn recognizes_image_extensions_case_insensitively() {
        assert!(is_image_file("foto.JPG"));
        assert!(is_image_file("foto.jpeg"));
        assert!(is_image_file("foto.png"));
        assert!(!is_image_file("notas.txt"));
        assert!(!is_image_file("sin_extension"));
    }

    #[actix_web::test]
    async fn missing_file_yields_file_error() {
        let (_guard, storage) = test_storage();
        let delivery_dir = storage.ensure_delivery_dir("G1").unwrap();
        let config = test_config();

        let result = process_photo(
            1,
            Path::new("/nonexistent/foto_1.jpg"),
            None,
            &config,
            &storage,
            &delivery_dir,
        )
        .await;

        assert_eq!(result.index, 1);
        assert_eq!(result.status, PhotoStatus::FileError);
        assert!(result.error_message.is_some());
        assert!(result.elapsed_seconds >= 0.0);
    }

    #[actix_web::test]
    async fn unrecognized_extension_yields_format_error() {
        let (_guard, storage) = test_storage();
        let delivery_dir = storage.ensure_delivery_dir("G1").unwrap();
        let notes = delivery_dir.join("notas.txt");
        std::fs::write(&notes, b"not an image").unwrap();

        let result = process_photo(1, &notes, None, &test_config(), &storage, &delivery_dir).await;
        assert_eq!(result.status, PhotoStatus::FormatError);
    }

    #[actix_web::test]
    async fn undecodable_image_yields_format_error() {
        let (_guard, storage) = test_storage();
        let delivery_dir = storage.ensure_delivery_dir("G1").unwrap();
        let bogus = delivery_dir.join("foto_1.jpg");
        std::fs::write(&bogus, b"jpeg? no").unwrap();

        let result = process_photo(1, &bogus, None, &test_config(), &storage, &delivery_dir).await;
        assert_eq!(result.status, PhotoStatus::FormatError);
    }

    #[actix_web::test]
    async fn missing_client_yields_api_error() {
        let (_guard, storage) = test_storage();
        let delivery_dir = storage.ensure_delivery_dir("G1").unwrap();
        let photo = delivery_dir.join("foto_1.jpg");
        RgbImage::new(64, 64).save(&photo).unwrap();

        let result = process_photo(1, &photo, None, &test_config(), &storage, &delivery_dir).await;
        assert_eq!(result.status, PhotoStatus::ApiError);
        assert_eq!(
            result.error_message.as_deref(),
            Some("inference client not initialized")
        );
        // registered photo lives inside the asset root, so it gets a public path
        assert_eq!(
            result.original_rel_path.as_deref(),
            Some("uploads/G1/foto_1.jpg")
        );
    }

    #[actix_web::test]
    async fn transport_failure_yields_api_error() {
        let (_guard, storage) = test_storage();
        let delivery_dir = storage.ensure_delivery_dir("G1").unwrap();
        let photo = delivery_dir.join("foto_1.jpg");
        RgbImage::new(64, 64).save(&photo).unwrap();

        let mut config = test_config();
        config.api_url = "http://127.0.0.1:1".to_string();
        let client = InferenceClient::new(&config).unwrap();

        let result =
            process_photo(1, &photo, Some(&client), &config, &storage, &delivery_dir).await;
        assert_eq!(result.status, PhotoStatus::ApiError);
    }
}
