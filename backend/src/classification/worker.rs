use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use shared::DeliveryStatus;

use crate::classification::aggregate::process_delivery;
use crate::config::RemoteConfig;
use crate::db::classification_repository::{ClassificationRepository, ClassificationUpdate};
use crate::inference::normalizer::round2;
use crate::storage::asset_service::AssetService;

/// Body of the detached background run for one delivery.
///
/// Receives only the delivery code and photo paths by value and resolves
/// its own remote configuration from the environment, so a misconfigured
/// worker records `config_error` for the delivery instead of inheriting
/// whatever the caller validated. Nothing here panics into the runtime and
/// nothing is reported back synchronously; the persisted record is the only
/// channel.
pub async fn run_classification_task(
    delivery_code: String,
    photo_paths: Vec<PathBuf>,
    repo: ClassificationRepository,
    storage: AssetService,
) {
    let started = Instant::now();
    log::info!("background classification started for delivery {delivery_code}");

    let config = RemoteConfig::from_env();
    if let Err(e) = config.validate() {
        log::error!("cannot classify delivery {delivery_code}: {e}");
        let update = ClassificationUpdate {
            status: Some(DeliveryStatus::ConfigError),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(db_err) = repo.store_classification(&delivery_code, update).await {
            log::error!("failed to record config error for {delivery_code}: {db_err}");
        }
        return;
    }

    let delivery_dir = storage.delivery_dir(&delivery_code);
    let json_path = storage.json_artifact_path(&delivery_code);
    let outcome = process_delivery(
        &delivery_code,
        &photo_paths,
        &delivery_dir,
        &json_path,
        &config,
        &storage,
    )
    .await;

    let summary = &outcome.result.summary;
    let final_status = if outcome.success {
        if summary.total_detected == 0 {
            DeliveryStatus::CompletedNoDetections
        } else {
            DeliveryStatus::Completed
        }
    } else {
        DeliveryStatus::ProcessingError
    };

    let update = ClassificationUpdate {
        status: Some(final_status),
        completed_at: Some(summary.completed_at),
        elapsed_seconds: Some(round2(started.elapsed().as_secs_f64())),
        total_detected: Some(summary.total_detected),
        category_totals_json: serde_json::to_string(&summary.categories).ok(),
        summary_json: serde_json::to_string(summary).ok(),
        ..Default::default()
    };
    match repo.store_classification(&delivery_code, update).await {
        Ok(()) => log::info!(
            "delivery {delivery_code} finished with status '{final_status}': {}",
            outcome.message
        ),
        Err(e) => log::error!("failed to persist outcome for delivery {delivery_code}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::tempdir;

    fn clear_inference_env() {
        for key in [
            "INFERENCE_API_URL",
            "INFERENCE_API_KEY",
            "INFERENCE_WORKSPACE",
            "INFERENCE_PROJECT",
            "INFERENCE_WORKFLOW_ID",
            "INFERENCE_TIMEOUT_SECS",
        ] {
            unsafe { env::remove_var(key) };
        }
    }

    async fn test_fixture() -> (tempfile::TempDir, ClassificationRepository, AssetService) {
        let dir = tempdir().unwrap();
        let pool = crate::db::init_pool(&dir.path().join("test.db")).await.unwrap();
        let storage = AssetService::new(dir.path().join("static")).unwrap();
        (dir, ClassificationRepository::new(pool), storage)
    }

    #[actix_web::test]
    #[serial]
    async fn missing_config_records_config_error() {
        clear_inference_env();
        let (_guard, repo, storage) = test_fixture().await;

        run_classification_task(
            "G1".to_string(),
            vec![PathBuf::from("/tmp/foto_1.jpg")],
            repo.clone(),
            storage,
        )
        .await;

        let record = repo.read_classification("G1").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::ConfigError);
        assert!(record.completed_at.is_some());
        // no aggregate fields were written for a run that never started
        assert_eq!(record.total_detected, None);
    }

    #[actix_web::test]
    #[serial]
    async fn all_photo_failures_record_processing_error_with_summary() {
        clear_inference_env();
        unsafe {
            env::set_var("INFERENCE_API_URL", "http://127.0.0.1:1");
            env::set_var("INFERENCE_API_KEY", "k");
            env::set_var("INFERENCE_WORKSPACE", "ws");
            env::set_var("INFERENCE_PROJECT", "p");
            env::set_var("INFERENCE_WORKFLOW_ID", "wf");
            env::set_var("INFERENCE_TIMEOUT_SECS", "2");
        }

        let (_guard, repo, storage) = test_fixture().await;
        let delivery_dir = storage.ensure_delivery_dir("G2").unwrap();
        let photo = delivery_dir.join("foto_1.jpg");
        image::RgbImage::new(32, 32).save(&photo).unwrap();

        run_classification_task("G2".to_string(), vec![photo], repo.clone(), storage.clone()).await;

        let record = repo.read_classification("G2").await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::ProcessingError);
        assert_eq!(record.total_detected, Some(0));
        assert!(record.summary.is_some());
        assert!(record.category_totals.is_some());
        assert!(storage.json_artifact_path("G2").exists());
        clear_inference_env();
    }
}
