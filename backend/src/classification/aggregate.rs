use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use shared::{
    AggregateSummary, CategoryBreakdown, ClassificationCategory, DeliveryClassificationResult,
    PhotoResult,
};
use strum::IntoEnumIterator;

use crate::classification::photo::process_photo;
use crate::config::RemoteConfig;
use crate::inference::client::InferenceClient;
use crate::inference::normalizer::round2;
use crate::storage::asset_service::AssetService;

/// What one background run hands back to its caller. The in-memory result
/// is populated even when `success` is false so downstream consumers can
/// still use whatever was computed.
#[derive(Debug)]
pub struct AggregationOutcome {
    pub success: bool,
    pub message: String,
    pub result: DeliveryClassificationResult,
}

/// Delivery-level totals over a finished photo-result list. Ok photos feed
/// the counts; failed photos only feed `photos_error` and the error list.
pub fn summarize(delivery_code: &str, photos: &[PhotoResult]) -> AggregateSummary {
    let mut categories: BTreeMap<ClassificationCategory, CategoryBreakdown> =
        ClassificationCategory::iter()
            .map(|c| (c, CategoryBreakdown::default()))
            .collect();
    let mut total_detected: i64 = 0;
    let mut photos_ok = 0u32;
    let mut photos_error = 0u32;

    for photo in photos {
        if photo.is_ok() {
            photos_ok += 1;
            total_detected += photo.total_bunches;
            for (category, breakdown) in &photo.categories {
                categories
                    .get_mut(category)
                    .expect("all categories present")
                    .count += breakdown.count;
            }
        } else {
            photos_error += 1;
        }
    }

    if total_detected > 0 {
        for entry in categories.values_mut() {
            entry.percentage = round2(entry.count as f64 / total_detected as f64 * 100.0);
        }
    }

    AggregateSummary {
        delivery_code: delivery_code.to_string(),
        completed_at: Utc::now(),
        total_detected,
        photos_ok,
        photos_error,
        categories,
        errors: photos.iter().filter(|p| !p.is_ok()).cloned().collect(),
    }
}

/// Runs the whole classification pipeline for one delivery: every photo in
/// input order, strictly sequential, then the aggregate and the durable
/// JSON artifact.
pub async fn process_delivery(
    delivery_code: &str,
    photo_paths: &[PathBuf],
    delivery_dir: &Path,
    json_path: &Path,
    config: &RemoteConfig,
    storage: &AssetService,
) -> AggregationOutcome {
    log::info!(
        "starting classification for delivery {delivery_code} ({} photos)",
        photo_paths.len()
    );
    let started_at = Utc::now();
    let started = Instant::now();

    let failure = |message: String| {
        log::error!("delivery {delivery_code}: {message}");
        AggregationOutcome {
            success: false,
            message,
            result: DeliveryClassificationResult {
                delivery_code: delivery_code.to_string(),
                started_at,
                photos: Vec::new(),
                errors: Vec::new(),
                elapsed_seconds: 0.0,
                summary: summarize(delivery_code, &[]),
            },
        }
    };

    if let Err(e) = config.validate() {
        return failure(e.to_string());
    }
    if let Err(e) = fs::create_dir_all(delivery_dir) {
        return failure(format!(
            "failed to create output directory {}: {e}",
            delivery_dir.display()
        ));
    }
    let client = match InferenceClient::new(config) {
        Ok(client) => client,
        Err(e) => return failure(format!("failed to initialize inference client: {e}")),
    };

    let mut photos = Vec::with_capacity(photo_paths.len());
    for (position, path) in photo_paths.iter().enumerate() {
        log::info!(
            "processing photo {}/{} for delivery {delivery_code}",
            position + 1,
            photo_paths.len()
        );
        let photo = process_photo(
            position + 1,
            path,
            Some(&client),
            config,
            storage,
            delivery_dir,
        )
        .await;
        photos.push(photo);
    }

    let summary = summarize(delivery_code, &photos);
    let mut success = summary.photos_ok > 0;
    let mut message = format!(
        "Processing finished: {} photos ok, {} with errors.",
        summary.photos_ok, summary.photos_error
    );

    let result = DeliveryClassificationResult {
        delivery_code: delivery_code.to_string(),
        started_at,
        errors: summary.errors.clone(),
        photos,
        elapsed_seconds: round2(started.elapsed().as_secs_f64()),
        summary,
    };

    match serde_json::to_string_pretty(&result) {
        Ok(encoded) => {
            if let Err(e) = fs::write(json_path, encoded) {
                success = false;
                message = format!("failed to write results artifact: {e}");
                log::error!("delivery {delivery_code}: {message}");
            } else {
                log::info!("results artifact written to {}", json_path.display());
            }
        }
        Err(e) => {
            success = false;
            message = format!("failed to serialize results: {e}");
            log::error!("delivery {delivery_code}: {message}");
        }
    }

    log::info!(
        "delivery {delivery_code} finished in {:.2}s: {message}",
        result.elapsed_seconds
    );
    AggregationOutcome {
        success,
        message,
        result,
    }
}

/// Reads a previously written results artifact back into memory, for the
/// detail-view reconstruction feature.
pub fn load_result_artifact(
    json_path: &Path,
) -> Result<DeliveryClassificationResult, std::io::Error> {
    let raw = fs::read_to_string(json_path)?;
    serde_json::from_str(&raw).map_err(std::io::Error::other)
}
