use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};
use shared::{CategoryBreakdown, ClassificationCategory, Detection};
use strum::IntoEnumIterator;

/// Dedicated total-count field some workflow versions return. The workflow
/// was cloned from an object-counting template and kept its field name.
pub const TOTAL_COUNT_KEY: &str = "potholes_detected";

const CLASSIFIED_IMAGE_KEY: &str = "annotated_image";
const LABEL_VIZ_IMAGE_KEY: &str = "label_visualization_1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Service-rendered image with class labels drawn in.
    Classified,
    /// Service-rendered label/count visualization.
    LabelVisualization,
}

impl ArtifactKind {
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::Classified => "_classified.jpg",
            Self::LabelVisualization => "_label_viz.jpg",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedArtifact {
    pub kind: ArtifactKind,
    pub bytes: Vec<u8>,
}

/// Canonical view of one inference response, whatever shape it arrived in.
///
/// `service_total` distinguishes "the service said zero" from "the service
/// said nothing"; absence and zero are never conflated.
#[derive(Debug, Default)]
pub struct NormalizedResponse {
    pub service_total: Option<i64>,
    pub direct_counts: BTreeMap<ClassificationCategory, u32>,
    pub detections: Vec<Detection>,
    pub artifacts: Vec<DecodedArtifact>,
}

impl NormalizedResponse {
    pub fn direct_total(&self) -> u32 {
        self.direct_counts.values().sum()
    }

    /// Per-category breakdown for one photo over all five categories.
    /// Direct counts take precedence; bbox detections only fill in when
    /// every direct count is zero (they exist for visualization and audit,
    /// not double-counting).
    pub fn category_breakdown(
        &self,
    ) -> (BTreeMap<ClassificationCategory, CategoryBreakdown>, u32) {
        let mut breakdown: BTreeMap<ClassificationCategory, CategoryBreakdown> =
            ClassificationCategory::iter()
                .map(|c| (c, CategoryBreakdown::default()))
                .collect();
        let mut total = 0u32;

        for (category, count) in &self.direct_counts {
            breakdown.get_mut(category).expect("all categories present").count += count;
            total += count;
        }
        if total == 0 && !self.detections.is_empty() {
            log::info!("no direct counts, falling back to bbox detection counts");
            for detection in &self.detections {
                breakdown
                    .get_mut(&detection.category)
                    .expect("all categories present")
                    .count += 1;
                total += 1;
            }
        }
        if total > 0 {
            for entry in breakdown.values_mut() {
                entry.percentage = round2(entry.count as f64 / total as f64 * 100.0);
            }
        }
        (breakdown, total)
    }

    /// Resolved bunch total for the photo: the authoritative service total
    /// when present, else whatever the breakdown arrived at.
    pub fn resolved_total(&self, breakdown_total: u32) -> i64 {
        match self.service_total {
            Some(total) => total,
            None => breakdown_total as i64,
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Maps a raw inference response to the canonical detection/count model.
/// Defensive at every step: a malformed field degrades to "absent" instead
/// of failing the photo.
pub fn normalize(raw: &Value, image_width: u32, image_height: u32) -> NormalizedResponse {
    let mut normalized = NormalizedResponse::default();
    let Some(primary) = primary_output(raw) else {
        log::warn!("inference response has no usable output object");
        return normalized;
    };

    normalized.service_total = extract_service_total(primary);
    normalized.direct_counts = extract_direct_counts(primary);
    normalized.detections = extract_detections(primary, image_width, image_height);
    normalized.artifacts = extract_artifacts(primary);
    normalized
}

/// The object actually carrying the results: `outputs[0]` when the response
/// wraps them, else the root object itself.
fn primary_output(raw: &Value) -> Option<&Map<String, Value>> {
    match raw.get("outputs").and_then(Value::as_array) {
        Some(outputs) if !outputs.is_empty() => outputs[0].as_object(),
        _ => raw.as_object(),
    }
}

fn extract_service_total(primary: &Map<String, Value>) -> Option<i64> {
    let raw = primary.get(TOTAL_COUNT_KEY)?;
    if raw.is_null() {
        return None;
    }
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    match text.parse::<i64>() {
        Ok(total) => Some(total),
        Err(_) => {
            log::warn!("total-count field '{text}' is not an integer, treating as absent");
            None
        }
    }
}

fn extract_direct_counts(
    primary: &Map<String, Value>,
) -> BTreeMap<ClassificationCategory, u32> {
    let mut counts = BTreeMap::new();
    for (key, value) in primary {
        if key == TOTAL_COUNT_KEY {
            continue;
        }
        let Some(category) = ClassificationCategory::from_external_label(key) else {
            log::debug!("ignoring unmapped output field '{key}'");
            continue;
        };
        let Some(quantity) = value.as_i64().or_else(|| value.as_f64().map(|v| v as i64)) else {
            log::warn!("value for mapped field '{key}' is not numeric: {value}");
            continue;
        };
        if quantity > 0 {
            *counts.entry(category).or_insert(0) += quantity as u32;
        }
    }
    counts
}

fn extract_detections(
    primary: &Map<String, Value>,
    image_width: u32,
    image_height: u32,
) -> Vec<Detection> {
    let Some(raw_predictions) = primary.get("predictions") else {
        return Vec::new();
    };
    let Some(predictions) = raw_predictions.as_array() else {
        log::warn!("'predictions' field is not a list, ignoring bbox detections");
        return Vec::new();
    };
    if image_width == 0 || image_height == 0 {
        log::warn!("image dimensions unavailable, bbox detections not scaled");
        return Vec::new();
    }

    let mut detections = Vec::new();
    for prediction in predictions {
        let Some(entry) = prediction.as_object() else { continue };
        let Some(category) = entry
            .get("class")
            .and_then(Value::as_str)
            .and_then(ClassificationCategory::from_external_label)
        else {
            continue;
        };
        let Some(confidence) = entry.get("confidence").and_then(Value::as_f64) else {
            continue;
        };
        let (Some(x), Some(y), Some(width), Some(height)) = (
            entry.get("x").and_then(Value::as_f64),
            entry.get("y").and_then(Value::as_f64),
            entry.get("width").and_then(Value::as_f64),
            entry.get("height").and_then(Value::as_f64),
        ) else {
            continue;
        };

        // fractional center-form geometry scaled to absolute pixels
        let x1 = ((x - width / 2.0) * image_width as f64) as i64;
        let y1 = ((y - height / 2.0) * image_height as f64) as i64;
        let x2 = ((x + width / 2.0) * image_width as f64) as i64;
        let y2 = ((y + height / 2.0) * image_height as f64) as i64;

        detections.push(Detection {
            category,
            confidence: round3(confidence),
            bbox: [x1, y1, x2, y2],
            x,
            y,
            width,
            height,
        });
    }
    detections
}

fn extract_artifacts(primary: &Map<String, Value>) -> Vec<DecodedArtifact> {
    let mut artifacts = Vec::new();
    for (key, kind) in [
        (CLASSIFIED_IMAGE_KEY, ArtifactKind::Classified),
        (LABEL_VIZ_IMAGE_KEY, ArtifactKind::LabelVisualization),
    ] {
        let Some(field) = primary.get(key).and_then(Value::as_object) else {
            continue;
        };
        if field.get("type").and_then(Value::as_str) != Some("base64") {
            continue;
        }
        let Some(value) = field.get("value").and_then(Value::as_str) else {
            continue;
        };
        match decode_base64_image(value) {
            Some(bytes) => artifacts.push(DecodedArtifact { kind, bytes }),
            None => log::error!("failed to decode '{key}' image, skipping that artifact"),
        }
    }
    artifacts
}

/// Decodes base64 image data tolerantly: strips data-url prefixes and
/// whitespace, restores padding, and retries after dropping stray
/// characters before giving up.
pub fn decode_base64_image(data: &str) -> Option<Vec<u8>> {
    let mut data = data.trim().to_string();
    if data.starts_with("data:image") {
        data = data.splitn(2, ',').nth(1)?.to_string();
    }
    data.retain(|c| !c.is_whitespace());
    let missing = data.len() % 4;
    if missing != 0 {
        data.push_str(&"=".repeat(4 - missing));
    }
    match BASE64.decode(&data) {
        Ok(bytes) => Some(bytes),
        Err(_) => {
            let filtered: String = data
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
                .collect();
            BASE64.decode(&filtered).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrapped(output: Value) -> Value {
        json!({"outputs": [output]})
    }

    #[test]
    fn prefers_first_output_over_root_fields() {
        let raw = json!({
            "verde": 99,
            "outputs": [{"verde": 3}],
        });
        let normalized = normalize(&raw, 100, 100);
        assert_eq!(
            normalized.direct_counts.get(&ClassificationCategory::Green),
            Some(&3)
        );
    }

    #[test]
    fn falls_back_to_root_object_without_outputs() {
        let raw = json!({"sobremaduro": 2, "potholes_detected": "5"});
        let normalized = normalize(&raw, 100, 100);
        assert_eq!(normalized.service_total, Some(5));
        assert_eq!(
            normalized.direct_counts.get(&ClassificationCategory::Overripe),
            Some(&2)
        );
    }

    #[test]
    fn non_integer_total_is_absent_not_zero() {
        let normalized = normalize(&wrapped(json!({"potholes_detected": "n/a"})), 100, 100);
        assert_eq!(normalized.service_total, None);

        let normalized = normalize(&wrapped(json!({"potholes_detected": 0})), 100, 100);
        assert_eq!(normalized.service_total, Some(0));
    }

    #[test]
    fn synonym_fields_accumulate_into_one_category() {
        let raw = wrapped(json!({"verde": 2, "racimos verdes": 3, "maduro": 7}));
        let normalized = normalize(&raw, 100, 100);
        assert_eq!(
            normalized.direct_counts.get(&ClassificationCategory::Green),
            Some(&5)
        );
        // 'maduro' is not one of the five categories
        assert_eq!(normalized.direct_total(), 5);
    }

    #[test]
    fn detections_scale_fractional_geometry_to_pixels() {
        let raw = wrapped(json!({
            "predictions": [
                {"class": "racimo podrido", "confidence": 0.87654,
                 "x": 0.5, "y": 0.5, "width": 0.2, "height": 0.4},
                {"class": "unknown-thing", "confidence": 0.9,
                 "x": 0.5, "y": 0.5, "width": 0.2, "height": 0.4},
                {"class": "verde", "confidence": 0.8, "x": 0.1, "y": 0.1},
                {"class": "verde", "x": 0.1, "y": 0.1, "width": 0.1, "height": 0.1},
            ]
        }));
        let normalized = normalize(&raw, 1000, 500);

        // unmappable class, incomplete geometry and missing confidence all skipped
        assert_eq!(normalized.detections.len(), 1);
        let detection = &normalized.detections[0];
        assert_eq!(detection.category, ClassificationCategory::Rotten);
        assert_eq!(detection.confidence, 0.877);
        assert_eq!(detection.bbox, [400, 150, 600, 350]);
    }

    #[test]
    fn authoritative_total_wins_over_direct_and_bbox_counts() {
        let raw = wrapped(json!({
            "potholes_detected": 7,
            "verde": 3,
            "sobremaduro": 2,
            "predictions": [
                {"class": "verde", "confidence": 0.9, "x": 0.2, "y": 0.2, "width": 0.1, "height": 0.1},
                {"class": "verde", "confidence": 0.9, "x": 0.4, "y": 0.4, "width": 0.1, "height": 0.1},
                {"class": "verde", "confidence": 0.9, "x": 0.6, "y": 0.6, "width": 0.1, "height": 0.1},
            ]
        }));
        let normalized = normalize(&raw, 100, 100);
        let (_, breakdown_total) = normalized.category_breakdown();
        assert_eq!(breakdown_total, 5);
        assert_eq!(normalized.resolved_total(breakdown_total), 7);
    }

    #[test]
    fn direct_counts_win_when_total_absent() {
        let raw = wrapped(json!({
            "verde": 3,
            "sobremaduro": 2,
            "predictions": [
                {"class": "verde", "confidence": 0.9, "x": 0.2, "y": 0.2, "width": 0.1, "height": 0.1},
                {"class": "verde", "confidence": 0.9, "x": 0.4, "y": 0.4, "width": 0.1, "height": 0.1},
                {"class": "verde", "confidence": 0.9, "x": 0.6, "y": 0.6, "width": 0.1, "height": 0.1},
            ]
        }));
        let normalized = normalize(&raw, 100, 100);
        let (breakdown, total) = normalized.category_breakdown();
        assert_eq!(total, 5);
        assert_eq!(normalized.resolved_total(total), 5);
        // bbox detections recorded but excluded from counts
        assert_eq!(normalized.detections.len(), 3);
        assert_eq!(breakdown[&ClassificationCategory::Green].count, 3);
        assert_eq!(breakdown[&ClassificationCategory::Overripe].count, 2);
    }

    #[test]
    fn bbox_counts_fill_in_when_direct_counts_are_zero() {
        let raw = wrapped(json!({
            "verde": 0,
            "predictions": [
                {"class": "verde", "confidence": 0.9, "x": 0.2, "y": 0.2, "width": 0.1, "height": 0.1},
                {"class": "podrido", "confidence": 0.8, "x": 0.4, "y": 0.4, "width": 0.1, "height": 0.1},
                {"class": "verde", "confidence": 0.7, "x": 0.6, "y": 0.6, "width": 0.1, "height": 0.1},
            ]
        }));
        let normalized = normalize(&raw, 100, 100);
        let (breakdown, total) = normalized.category_breakdown();
        assert_eq!(total, 3);
        assert_eq!(normalized.resolved_total(total), 3);
        assert_eq!(breakdown[&ClassificationCategory::Green].count, 2);
        assert_eq!(breakdown[&ClassificationCategory::Rotten].count, 1);
    }

    #[test]
    fn everything_absent_resolves_to_zero() {
        let normalized = normalize(&wrapped(json!({})), 100, 100);
        let (breakdown, total) = normalized.category_breakdown();
        assert_eq!(total, 0);
        assert_eq!(normalized.resolved_total(total), 0);
        for entry in breakdown.values() {
            assert_eq!(entry.count, 0);
            assert_eq!(entry.percentage, 0.0);
        }
    }

    #[test]
    fn percentages_sum_to_one_hundred_within_rounding() {
        let raw = wrapped(json!({"verde": 1, "sobremaduro": 1, "podrido": 1}));
        let normalized = normalize(&raw, 100, 100);
        let (breakdown, total) = normalized.category_breakdown();
        assert_eq!(total, 3);
        let sum: f64 = breakdown.values().map(|b| b.percentage).sum();
        assert!((sum - 100.0).abs() < 0.1, "sum was {sum}");
    }

    #[test]
    fn artifact_decode_failure_skips_only_that_artifact() {
        let good = BASE64.encode(b"image-bytes");
        let raw = wrapped(json!({
            "annotated_image": {"type": "base64", "value": "!!!not-base64!!!"},
            "label_visualization_1": {"type": "base64", "value": good},
        }));
        let normalized = normalize(&raw, 100, 100);
        assert_eq!(normalized.artifacts.len(), 1);
        assert_eq!(normalized.artifacts[0].kind, ArtifactKind::LabelVisualization);
        assert_eq!(normalized.artifacts[0].bytes, b"image-bytes");
    }

    #[test]
    fn artifacts_with_url_type_are_ignored() {
        let raw = wrapped(json!({
            "annotated_image": {"type": "url", "value": "https://cdn.example.com/a.jpg"},
        }));
        let normalized = normalize(&raw, 100, 100);
        assert!(normalized.artifacts.is_empty());
    }

    #[test]
    fn decode_handles_data_urls_and_missing_padding() {
        let encoded = BASE64.encode(b"pixels");
        let data_url = format!("data:image/jpeg;base64,{encoded}");
        assert_eq!(decode_base64_image(&data_url).unwrap(), b"pixels");

        let unpadded = encoded.trim_end_matches('=').to_string();
        assert_eq!(decode_base64_image(&unpadded).unwrap(), b"pixels");
    }

    #[test]
    fn non_object_response_normalizes_to_empty() {
        let normalized = normalize(&json!([1, 2, 3]), 100, 100);
        assert_eq!(normalized.service_total, None);
        assert!(normalized.direct_counts.is_empty());
        assert!(normalized.detections.is_empty());
    }
}
