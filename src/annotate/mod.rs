// Annotation renderer
//
// Draws detection boxes, face markers and connected labels onto the
// original pixels, then re-encodes. Z-order: boxes, face dots, labels.
// Given the same pixels and the same render request the output bytes are
// identical across runs, which is what lets renders live behind an
// annotate cache key.

pub mod font;

use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::{
    AnnotationStats, ConfidenceStats, Detection, DetectionArtifact, FaceArtifact, RenderRequest,
};
use crate::utils::image_ops::encode_image_sync;
use image::{Rgba, RgbaImage};
use std::collections::HashMap;

pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stats: AnnotationStats,
}

pub struct AnnotationRenderer;

impl AnnotationRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Render on the blocking pool; decode and pixel work are CPU-bound.
    pub async fn render(
        &self,
        original: Vec<u8>,
        detections: DetectionArtifact,
        faces: FaceArtifact,
        request: RenderRequest,
    ) -> ApiResult<RenderOutput> {
        tokio::task::spawn_blocking(move || render_sync(&original, &detections, &faces, &request))
            .await
            .map_err(|e| ApiError::processing("render", e.to_string()))?
    }
}

impl Default for AnnotationRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn render_sync(
    original: &[u8],
    detections: &DetectionArtifact,
    faces: &FaceArtifact,
    request: &RenderRequest,
) -> ApiResult<RenderOutput> {
    let decoded = image::load_from_memory(original)
        .map_err(|e| ApiError::validation(format!("image decode failed: {e}")))?;
    let mut img = decoded.to_rgba8();
    let (width, height) = img.dimensions();

    // Top-N by confidence above the render threshold
    let mut selected: Vec<&Detection> = detections
        .detections
        .iter()
        .filter(|d| d.confidence >= request.confidence_threshold)
        .collect();
    selected.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });
    selected.truncate(request.max_objects);

    let box_color = parse_hex(&request.style.box_color);
    let face_color = parse_hex(&request.style.face_marker_color);
    let label_color = parse_hex(&request.style.label_color);
    let connector_color = parse_hex(&request.style.connector_color);
    let text_bg = parse_hex(&request.style.text_bg);

    // (1) bounding boxes
    if request.include_boxes {
        for detection in &selected {
            let rect = to_pixel_rect(detection, width, height);
            draw_rect_outline(&mut img, rect, request.style.box_thickness, box_color);
        }
    }

    // (2) face dots
    let mut faces_drawn = 0usize;
    if request.include_faces {
        for face in &faces.faces {
            let cx = (face.center.x * width as f32) as i32;
            let cy = (face.center.y * height as f32) as i32;
            draw_filled_circle(&mut img, cx, cy, request.style.face_marker_radius as i32, face_color);
            faces_drawn += 1;
        }
    }

    // (3) connected labels, stacked in a left column
    if request.include_labels {
        let scale = (request.style.label_font_px / font::GLYPH_HEIGHT).max(1);
        let line_height = font::GLYPH_HEIGHT * scale + 4;
        let column_x: i32 = 8;
        let mut label_y: i32 = 8;

        for detection in &selected {
            let text = format!("{} ({:.2})", detection.class_name, detection.confidence);
            let text_w = font::text_width(&text, scale);

            // Clip the whole line to image bounds rather than wrap
            if label_y + line_height as i32 > height as i32 {
                break;
            }

            draw_filled_rect_blend(
                &mut img,
                column_x - 2,
                label_y - 2,
                text_w as i32 + 4,
                line_height as i32,
                text_bg,
                request.style.text_alpha,
            );
            draw_text(&mut img, column_x, label_y, &text, scale, label_color);

            // Connector from the nearest box edge to the label's top-left
            let rect = to_pixel_rect(detection, width, height);
            let (ex, ey) = nearest_edge_point(rect, column_x, label_y);
            draw_line(&mut img, ex, ey, column_x, label_y, connector_color);

            label_y += line_height as i32 + 2;
        }
    }

    let stats = build_stats(&selected, faces_drawn);
    let bytes = encode_image_sync(
        &image::DynamicImage::ImageRgba8(img),
        request.format,
        request.quality,
    )?;

    Ok(RenderOutput {
        bytes,
        width,
        height,
        stats,
    })
}

fn build_stats(selected: &[&Detection], total_faces: usize) -> AnnotationStats {
    let mut class_histogram: HashMap<String, usize> = HashMap::new();
    for detection in selected {
        *class_histogram.entry(detection.class_name.clone()).or_default() += 1;
    }

    let confidences: Vec<f32> = selected.iter().map(|d| d.confidence).collect();
    let confidence = if confidences.is_empty() {
        ConfidenceStats {
            mean: 0.0,
            min: 0.0,
            max: 0.0,
            high: 0,
            medium: 0,
            low: 0,
        }
    } else {
        ConfidenceStats {
            mean: confidences.iter().sum::<f32>() / confidences.len() as f32,
            min: confidences.iter().copied().fold(f32::MAX, f32::min),
            max: confidences.iter().copied().fold(f32::MIN, f32::max),
            high: confidences.iter().filter(|c| **c >= 0.8).count(),
            medium: confidences.iter().filter(|c| **c >= 0.5 && **c < 0.8).count(),
            low: confidences.iter().filter(|c| **c < 0.5).count(),
        }
    };

    AnnotationStats {
        total_objects: selected.len(),
        total_faces,
        class_histogram,
        confidence,
    }
}

#[derive(Debug, Clone, Copy)]
struct PixelRect {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

fn to_pixel_rect(detection: &Detection, width: u32, height: u32) -> PixelRect {
    let b = &detection.bounding_box;
    PixelRect {
        x: (b.x * width as f32) as i32,
        y: (b.y * height as f32) as i32,
        w: (b.width * width as f32) as i32,
        h: (b.height * height as f32) as i32,
    }
}

/// Point on the rectangle border closest to (px, py).
fn nearest_edge_point(rect: PixelRect, px: i32, py: i32) -> (i32, i32) {
    let cx = px.clamp(rect.x, rect.x + rect.w);
    let cy = py.clamp(rect.y, rect.y + rect.h);
    // Clamping an outside point lands on the border already; an inside
    // point gets pushed to the nearest edge.
    if cx > rect.x && cx < rect.x + rect.w && cy > rect.y && cy < rect.y + rect.h {
        let to_left = cx - rect.x;
        let to_right = rect.x + rect.w - cx;
        let to_top = cy - rect.y;
        let to_bottom = rect.y + rect.h - cy;
        let min = to_left.min(to_right).min(to_top).min(to_bottom);
        if min == to_left {
            (rect.x, cy)
        } else if min == to_right {
            (rect.x + rect.w, cy)
        } else if min == to_top {
            (cx, rect.y)
        } else {
            (cx, rect.y + rect.h)
        }
    } else {
        (cx, cy)
    }
}

fn parse_hex(hex: &str) -> Rgba<u8> {
    let hex = hex.trim_start_matches('#');
    if hex.len() == 6 {
        if let (Ok(r), Ok(g), Ok(b)) = (
            u8::from_str_radix(&hex[0..2], 16),
            u8::from_str_radix(&hex[2..4], 16),
            u8::from_str_radix(&hex[4..6], 16),
        ) {
            return Rgba([r, g, b, 255]);
        }
    }
    Rgba([255, 255, 255, 255])
}

fn put_px(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

fn blend_px(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>, alpha: u8) {
    if x < 0 || y < 0 || x as u32 >= img.width() || y as u32 >= img.height() {
        return;
    }
    let base = img.get_pixel(x as u32, y as u32);
    let a = alpha as u32;
    let inv = 255 - a;
    let blended = Rgba([
        ((color.0[0] as u32 * a + base.0[0] as u32 * inv) / 255) as u8,
        ((color.0[1] as u32 * a + base.0[1] as u32 * inv) / 255) as u8,
        ((color.0[2] as u32 * a + base.0[2] as u32 * inv) / 255) as u8,
        255,
    ]);
    img.put_pixel(x as u32, y as u32, blended);
}

fn draw_rect_outline(img: &mut RgbaImage, rect: PixelRect, thickness: u32, color: Rgba<u8>) {
    for i in 0..thickness as i32 {
        let x0 = rect.x - i;
        let y0 = rect.y - i;
        let x1 = rect.x + rect.w + i;
        let y1 = rect.y + rect.h + i;
        for x in x0..=x1 {
            put_px(img, x, y0, color);
            put_px(img, x, y1, color);
        }
        for y in y0..=y1 {
            put_px(img, x0, y, color);
            put_px(img, x1, y, color);
        }
    }
}

fn draw_filled_circle(img: &mut RgbaImage, cx: i32, cy: i32, radius: i32, color: Rgba<u8>) {
    let r2 = radius * radius;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= r2 {
                put_px(img, cx + dx, cy + dy, color);
            }
        }
    }
}

fn draw_filled_rect_blend(
    img: &mut RgbaImage,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    color: Rgba<u8>,
    alpha: u8,
) {
    for yy in y..y + h {
        for xx in x..x + w {
            blend_px(img, xx, yy, color, alpha);
        }
    }
}

/// Bresenham line.
fn draw_line(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);
    loop {
        put_px(img, x, y, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, scale: u32, color: Rgba<u8>) {
    let mut pen_x = x;
    for c in text.chars() {
        let rows = font::glyph(c);
        for (row_idx, row) in rows.iter().enumerate() {
            for col in 0..font::GLYPH_WIDTH {
                if row & (1 << (font::GLYPH_WIDTH - 1 - col)) != 0 {
                    for sy in 0..scale as i32 {
                        for sx in 0..scale as i32 {
                            put_px(
                                img,
                                pen_x + (col * scale) as i32 + sx,
                                y + (row_idx as u32 * scale) as i32 + sy,
                                color,
                            );
                        }
                    }
                }
            }
        }
        pen_x += (font::GLYPH_ADVANCE * scale) as i32;
    }
}
