use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Canonical fruit-quality categories recognized by the classification
/// pipeline. Every external vocabulary string maps to exactly one of these.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClassificationCategory {
    Green,
    Overripe,
    CrownRot,
    LongPeduncle,
    Rotten,
}

impl ClassificationCategory {
    /// Maps a surface-form label from the remote service (or a manual-entry
    /// form) to its canonical category. Lookup is case-insensitive and
    /// whitespace-tolerant; unknown labels return `None`.
    pub fn from_external_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "green" | "verde" | "racimos verdes" | "racimo verde" => Some(Self::Green),
            "overripe" | "sobremaduro" | "racimo sobremaduro" => Some(Self::Overripe),
            "crown_rot"
            | "danio_en_corona"
            | "danio_corona"
            | "racimo daño en corona"
            | "racimo dano en corona" => Some(Self::CrownRot),
            "long_peduncle" | "pendunculo_largo" | "racimo pedunculo largo" => {
                Some(Self::LongPeduncle)
            }
            "rotten" | "fruta_podrida" | "podrido" | "racimo podrido" => Some(Self::Rotten),
            _ => None,
        }
    }
}

/// Count and percentage share for one category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    pub count: u32,
    pub percentage: f64,
}

/// One object detection inside a photo. The bbox is in absolute pixels,
/// derived from the fractional center-form geometry also kept here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub category: ClassificationCategory,
    pub confidence: f64,
    pub bbox: [i64; 4],
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PhotoStatus {
    Pending,
    Ok,
    FileError,
    FormatError,
    ApiError,
    UnexpectedError,
}

/// Outcome of processing a single photo. Created as `pending`, mutated in
/// place while the stages run, then appended to the delivery result and
/// never touched again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoResult {
    pub index: usize,
    pub filename: String,
    pub original_path: String,
    pub original_rel_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: PhotoStatus,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub elapsed_seconds: f64,
    pub detections: Vec<Detection>,
    pub direct_counts: BTreeMap<ClassificationCategory, u32>,
    pub categories: BTreeMap<ClassificationCategory, CategoryBreakdown>,
    pub total_bunches: i64,
    pub service_total: Option<i64>,
    pub annotated_rel_path: Option<String>,
    pub label_viz_rel_path: Option<String>,
    pub classified_rel_path: Option<String>,
}

impl PhotoResult {
    pub fn pending(index: usize, filename: String, original_path: String) -> Self {
        Self {
            index,
            filename,
            original_path,
            original_rel_path: None,
            started_at: Utc::now(),
            status: PhotoStatus::Pending,
            error_message: None,
            error_trace: None,
            elapsed_seconds: 0.0,
            detections: Vec::new(),
            direct_counts: BTreeMap::new(),
            categories: BTreeMap::new(),
            total_bunches: 0,
            service_total: None,
            annotated_rel_path: None,
            label_viz_rel_path: None,
            classified_rel_path: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PhotoStatus::Ok
    }
}

/// Delivery-level aggregate computed over the ok photos of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub delivery_code: String,
    pub completed_at: DateTime<Utc>,
    pub total_detected: i64,
    pub photos_ok: u32,
    pub photos_error: u32,
    pub categories: BTreeMap<ClassificationCategory, CategoryBreakdown>,
    pub errors: Vec<PhotoResult>,
}

/// Consolidated result of one background classification run, serialized
/// verbatim as the delivery's JSON artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryClassificationResult {
    pub delivery_code: String,
    pub started_at: DateTime<Utc>,
    pub photos: Vec<PhotoResult>,
    pub errors: Vec<PhotoResult>,
    pub elapsed_seconds: f64,
    pub summary: AggregateSummary,
}

/// Lifecycle of a delivery's automatic classification. The four terminal
/// states are final for a run; a re-submitted delivery overwrites them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Completed,
    CompletedNoDetections,
    ProcessingError,
    ConfigError,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedNoDetections
                | Self::ProcessingError
                | Self::ConfigError
        )
    }
}
