use std::io::Write;
use std::path::{Path, PathBuf};

use actix_files::Files;
use actix_multipart::Multipart;
use actix_web::{Error, HttpResponse, web};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use shared::DeliveryStatus;

use crate::classification::photo::is_image_file;
use crate::classification::worker::run_classification_task;
use crate::db::classification_repository::{ClassificationRepository, ClassificationUpdate};
use crate::storage::asset_service::AssetService;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, asset_root: PathBuf) {
    cfg.service(
        web::resource("/api/classification/{delivery_code}/photos")
            .route(web::post().to(register_photos)),
    )
    .service(
        web::resource("/api/classification/{delivery_code}/start")
            .route(web::post().to(start_classification)),
    )
    .service(
        web::resource("/api/classification/{delivery_code}/status")
            .route(web::get().to(get_classification_status)),
    )
    .service(
        web::resource("/api/classification/{delivery_code}")
            .route(web::get().to(get_classification)),
    )
    .service(Files::new("/static", asset_root));
}

/// Registers the photo set for a delivery. Replaces any previously
/// registered set; files land under the delivery's public directory.
async fn register_photos(
    path: web::Path<String>,
    mut payload: Multipart,
    repo: web::Data<ClassificationRepository>,
    storage: web::Data<AssetService>,
) -> Result<HttpResponse, Error> {
    let delivery_code = path.into_inner();
    let delivery_dir = match storage.ensure_delivery_dir(&delivery_code) {
        Ok(dir) => dir,
        Err(e) => {
            error!("could not create delivery directory for {delivery_code}: {e}");
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to prepare delivery storage".into(),
            }));
        }
    };

    let mut saved = Vec::new();
    while let Ok(Some(mut field)) = payload.try_next().await {
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(ToString::to_string)
            .unwrap_or_default();

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk?;
            image_data.write_all(&data)?;
        }
        if image_data.is_empty() {
            continue;
        }
        if !is_image_file(&filename) {
            return Ok(HttpResponse::BadRequest().json(ErrorResponse {
                error: format!("'{filename}' is not a supported image file"),
            }));
        }

        let extension = Path::new(&filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("jpg")
            .to_lowercase();
        let stored_name = format!("foto_{}.{extension}", saved.len() + 1);
        match storage.write_asset(&delivery_dir, &stored_name, &image_data) {
            Ok(rel) => saved.push(rel),
            Err(e) => {
                error!("failed to store photo {stored_name} for {delivery_code}: {e}");
                return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "Failed to store uploaded photo".into(),
                }));
            }
        }
    }

    if saved.is_empty() {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: "No image files found in upload".into(),
        }));
    }

    if let Err(e) = repo.ensure_delivery(&delivery_code).await {
        error!("failed to create classification record for {delivery_code}: {e}");
        return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
            error: "Failed to record classification".into(),
        }));
    }
    if let Err(e) = repo.replace_photos(&delivery_code, &saved).await {
        error!("failed to record photos for {delivery_code}: {e}");
        return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
            error: "Failed to record photos".into(),
        }));
    }

    info!("registered {} photos for delivery {delivery_code}", saved.len());
    Ok(HttpResponse::Created().json(json!({
        "delivery_code": delivery_code,
        "photos": saved,
    })))
}

/// Launches the background classification run and returns immediately.
async fn start_classification(
    path: web::Path<String>,
    repo: web::Data<ClassificationRepository>,
    storage: web::Data<AssetService>,
) -> HttpResponse {
    let delivery_code = path.into_inner();

    let record = match repo.read_classification(&delivery_code).await {
        Ok(record) => record,
        Err(e) => {
            error!("error loading classification for {delivery_code}: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to load classification record".into(),
            });
        }
    };
    let Some(record) = record else {
        return HttpResponse::NotFound().json(json!({
            "success": false,
            "message": "No classification data found for this delivery.",
        }));
    };
    if record.photos.is_empty() {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "message": "No photos registered for this delivery.",
        }));
    }

    // resolve stored (usually asset-relative) paths, dropping files that
    // have vanished from disk
    let mut photo_paths = Vec::new();
    for stored in &record.photos {
        let absolute = if Path::new(stored).is_absolute() {
            PathBuf::from(stored)
        } else {
            storage.resolve_relative(stored)
        };
        if absolute.exists() {
            photo_paths.push(absolute);
        } else {
            warn!("registered photo missing on disk: {}", absolute.display());
        }
    }
    if photo_paths.is_empty() {
        return HttpResponse::BadRequest().json(json!({
            "success": false,
            "message": "Photo files not found on disk.",
        }));
    }

    let update = ClassificationUpdate {
        status: Some(DeliveryStatus::Processing),
        started_at: Some(Utc::now()),
        ..Default::default()
    };
    if let Err(e) = repo.store_classification(&delivery_code, update).await {
        error!("failed to mark {delivery_code} as processing: {e}");
        return HttpResponse::InternalServerError().json(ErrorResponse {
            error: "Failed to update classification status".into(),
        });
    }

    let repo_clone = repo.get_ref().clone();
    let storage_clone = storage.get_ref().clone();
    let task_code = delivery_code.clone();
    actix_web::rt::spawn(async move {
        run_classification_task(task_code, photo_paths, repo_clone, storage_clone).await;
    });

    info!("background classification launched for delivery {delivery_code}");
    HttpResponse::Accepted().json(json!({
        "success": true,
        "message": "Automatic classification started in the background.",
        "check_status_url": format!("/api/classification/{delivery_code}/status"),
    }))
}

/// Polling endpoint: the persisted record is the single source of truth.
async fn get_classification_status(
    path: web::Path<String>,
    repo: web::Data<ClassificationRepository>,
) -> HttpResponse {
    let delivery_code = path.into_inner();
    match repo.read_classification(&delivery_code).await {
        Ok(Some(record)) => HttpResponse::Ok().json(json!({
            "status": record.status,
            "classification_complete": record.status.is_terminal(),
            "total_detected": record.total_detected.unwrap_or(0),
            "completed_at": record.completed_at,
        })),
        Ok(None) => HttpResponse::Ok().json(json!({
            "status": "not_found",
            "message": "No processing information found for this delivery.",
            "classification_complete": false,
            "total_detected": 0,
        })),
        Err(e) => {
            error!("error reading status for {delivery_code}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to read classification status".into(),
            })
        }
    }
}

async fn get_classification(
    path: web::Path<String>,
    repo: web::Data<ClassificationRepository>,
) -> HttpResponse {
    let delivery_code = path.into_inner();
    match repo.read_classification(&delivery_code).await {
        Ok(Some(record)) => {
            info!("retrieved classification for delivery {delivery_code}");
            HttpResponse::Ok().json(record)
        }
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            error: format!("No classification found for delivery {delivery_code}"),
        }),
        Err(e) => {
            error!("error retrieving classification for {delivery_code}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to retrieve classification".into(),
            })
        }
    }
}
