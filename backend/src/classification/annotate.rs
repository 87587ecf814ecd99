use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use shared::{ClassificationCategory, Detection};

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

const LABEL_SCALE: f32 = 20.0;
const BOX_WIDTH: i64 = 3;

lazy_static::lazy_static! {
    static ref LABEL_FONT: Option<FontVec> = load_label_font();
}

fn load_label_font() -> Option<FontVec> {
    for candidate in FONT_CANDIDATES {
        if let Ok(bytes) = std::fs::read(candidate) {
            if let Ok(font) = FontVec::try_from_vec(bytes) {
                return Some(font);
            }
        }
    }
    log::warn!("no label font available, annotated images will carry boxes without text");
    None
}

fn category_color(category: ClassificationCategory) -> Rgb<u8> {
    match category {
        ClassificationCategory::Green => Rgb([0, 128, 0]),
        ClassificationCategory::Overripe => Rgb([255, 0, 0]),
        ClassificationCategory::CrownRot => Rgb([255, 192, 203]),
        ClassificationCategory::LongPeduncle => Rgb([0, 0, 255]),
        ClassificationCategory::Rotten => Rgb([75, 0, 130]),
    }
}

/// Renders a copy of the original photo with one colored rectangle and
/// confidence label per detection, returned as encoded JPEG bytes. Used as
/// the fallback when the service supplied no annotated image of its own.
pub fn render_annotated_image(
    original_path: &Path,
    detections: &[Detection],
) -> Result<Vec<u8>, image::ImageError> {
    let mut canvas = image::open(original_path)?.to_rgb8();
    let (img_width, img_height) = canvas.dimensions();

    for detection in detections {
        let [x1, y1, x2, y2] = detection.bbox;
        let x1 = x1.clamp(0, img_width as i64 - 1);
        let y1 = y1.clamp(0, img_height as i64 - 1);
        let x2 = x2.clamp(0, img_width as i64 - 1);
        let y2 = y2.clamp(0, img_height as i64 - 1);
        if x2 <= x1 || y2 <= y1 {
            log::warn!("degenerate bbox {:?}, skipping", detection.bbox);
            continue;
        }

        let color = category_color(detection.category);
        for inset in 0..BOX_WIDTH.min((x2 - x1) / 2).min((y2 - y1) / 2).max(1) {
            let width = (x2 - x1 - 2 * inset) as u32;
            let height = (y2 - y1 - 2 * inset) as u32;
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at((x1 + inset) as i32, (y1 + inset) as i32).of_size(width, height),
                color,
            );
        }

        if let Some(font) = LABEL_FONT.as_ref() {
            let label = format!(
                "{}: {:.0}%",
                detection.category,
                detection.confidence * 100.0
            );
            let scale = PxScale::from(LABEL_SCALE);
            let (text_width, text_height) = text_size(scale, font, &label);
            let band_x = (x1 + 2) as i32;
            let band_y = (y1 + 2) as i32;
            draw_filled_rect_mut(
                &mut canvas,
                Rect::at(band_x, band_y).of_size(text_width + 4, text_height + 4),
                color,
            );
            draw_text_mut(
                &mut canvas,
                Rgb([255, 255, 255]),
                band_x + 2,
                band_y + 2,
                scale,
                font,
                &label,
            );
        }
    }

    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Jpeg)?;
    Ok(buffer)
}
