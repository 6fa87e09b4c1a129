// Vision provider wire and bundle types
//
// The wire structs mirror the provider's annotate response; the
// PrimitiveBundle is the normalized form the analyzers consume. Face boxes
// arrive in pixel coordinates and are normalized against the probed image
// dimensions before they leave this module.

use crate::core::types::{BoundingBox, LabelAnnotation, Likelihood, SafeSearch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Features a single annotate call can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    Label,
    ObjectLocalization,
    Face,
    ImageProperties,
    SafeSearch,
}

impl Feature {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Label => "LABEL_DETECTION",
            Self::ObjectLocalization => "OBJECT_LOCALIZATION",
            Self::Face => "FACE_DETECTION",
            Self::ImageProperties => "IMAGE_PROPERTIES",
            Self::SafeSearch => "SAFE_SEARCH_DETECTION",
        }
    }
}

/// One localized object as the provider reports it, bbox already normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawObject {
    pub name: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLandmark {
    pub kind: String,
    pub x: f32,
    pub y: f32,
}

/// One detected face, bbox and landmarks normalized to [0,1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFace {
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub landmarks: Vec<RawLandmark>,
    pub anger: Likelihood,
    pub joy: Likelihood,
    pub sorrow: Likelihood,
    pub surprise: Likelihood,
    pub blurred: Likelihood,
    pub headwear: Likelihood,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDominantColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    /// Fraction of image pixels attributed to this color, [0,1]
    pub pixel_fraction: f32,
    pub score: f32,
}

/// Normalized output of one annotate call. Analyzers are pure functions of
/// this bundle, which is what makes fingerprint-keyed caching sound.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimitiveBundle {
    pub labels: Vec<LabelAnnotation>,
    pub objects: Vec<RawObject>,
    pub faces: Vec<RawFace>,
    pub dominant_colors: Vec<RawDominantColor>,
    pub safe_search: Option<SafeSearch>,
    /// Features that were requested but did not come back, with the
    /// provider's reason. The coordinator decides whether the remainder is
    /// enough to proceed.
    pub feature_errors: HashMap<String, String>,
}

impl PrimitiveBundle {
    pub fn has_feature_error(&self, feature: Feature) -> bool {
        self.feature_errors.contains_key(feature.wire_name())
    }
}

// ===== provider wire format =====

#[derive(Debug, Deserialize)]
pub struct WireAnnotateResponse {
    #[serde(default)]
    pub responses: Vec<WireResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default)]
    pub label_annotations: Option<Vec<WireLabel>>,
    #[serde(default)]
    pub localized_object_annotations: Option<Vec<WireObject>>,
    #[serde(default)]
    pub face_annotations: Option<Vec<WireFace>>,
    #[serde(default)]
    pub image_properties_annotation: Option<WireImageProperties>,
    #[serde(default)]
    pub safe_search_annotation: Option<WireSafeSearch>,
    #[serde(default)]
    pub error: Option<WireStatus>,
}

#[derive(Debug, Deserialize)]
pub struct WireStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct WireLabel {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub topicality: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireObject {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub bounding_poly: WirePoly,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePoly {
    #[serde(default)]
    pub normalized_vertices: Vec<WireVertex>,
    #[serde(default)]
    pub vertices: Vec<WireVertex>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireVertex {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFace {
    #[serde(default)]
    pub detection_confidence: f32,
    #[serde(default)]
    pub bounding_poly: WirePoly,
    #[serde(default)]
    pub landmarks: Vec<WireFaceLandmark>,
    #[serde(default)]
    pub anger_likelihood: Option<String>,
    #[serde(default)]
    pub joy_likelihood: Option<String>,
    #[serde(default)]
    pub sorrow_likelihood: Option<String>,
    #[serde(default)]
    pub surprise_likelihood: Option<String>,
    #[serde(default)]
    pub blurred_likelihood: Option<String>,
    #[serde(default)]
    pub headwear_likelihood: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFaceLandmark {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub position: WirePosition,
}

#[derive(Debug, Default, Deserialize)]
pub struct WirePosition {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireImageProperties {
    #[serde(default)]
    pub dominant_colors: Option<WireDominantColors>,
}

#[derive(Debug, Deserialize)]
pub struct WireDominantColors {
    #[serde(default)]
    pub colors: Vec<WireColorInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireColorInfo {
    #[serde(default)]
    pub color: WireColor,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub pixel_fraction: f32,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireColor {
    #[serde(default)]
    pub red: f32,
    #[serde(default)]
    pub green: f32,
    #[serde(default)]
    pub blue: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSafeSearch {
    #[serde(default)]
    pub adult: Option<String>,
    #[serde(default)]
    pub violence: Option<String>,
    #[serde(default)]
    pub racy: Option<String>,
}

/// Bounding box from a polygon of normalized vertices.
pub fn bbox_from_normalized(poly: &WirePoly) -> BoundingBox {
    bbox_from_points(poly.normalized_vertices.iter().map(|v| (v.x, v.y)))
}

/// Bounding box from pixel vertices, normalized against the image size.
pub fn bbox_from_pixels(poly: &WirePoly, width: u32, height: u32) -> BoundingBox {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    bbox_from_points(poly.vertices.iter().map(|v| (v.x / w, v.y / h)))
}

fn bbox_from_points(points: impl Iterator<Item = (f32, f32)>) -> BoundingBox {
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    let mut any = false;
    for (x, y) in points {
        any = true;
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    if !any {
        return BoundingBox::clamped(0.0, 0.0, 0.0, 0.0);
    }
    BoundingBox::clamped(min_x, min_y, max_x - min_x, max_y - min_y)
}

impl From<&WireSafeSearch> for SafeSearch {
    fn from(w: &WireSafeSearch) -> Self {
        let parse = |s: &Option<String>| {
            s.as_deref().map(Likelihood::parse).unwrap_or(Likelihood::Unknown)
        };
        SafeSearch {
            adult: parse(&w.adult),
            violence: parse(&w.violence),
            racy: parse(&w.racy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_from_normalized_vertices() {
        let poly = WirePoly {
            normalized_vertices: vec![
                WireVertex { x: 0.1, y: 0.2 },
                WireVertex { x: 0.5, y: 0.2 },
                WireVertex { x: 0.5, y: 0.6 },
                WireVertex { x: 0.1, y: 0.6 },
            ],
            vertices: vec![],
        };
        let bbox = bbox_from_normalized(&poly);
        assert!((bbox.x - 0.1).abs() < 1e-6);
        assert!((bbox.width - 0.4).abs() < 1e-6);
        assert!((bbox.height - 0.4).abs() < 1e-6);
    }

    #[test]
    fn bbox_from_pixel_vertices_normalizes() {
        let poly = WirePoly {
            normalized_vertices: vec![],
            vertices: vec![
                WireVertex { x: 100.0, y: 50.0 },
                WireVertex { x: 300.0, y: 150.0 },
            ],
        };
        let bbox = bbox_from_pixels(&poly, 400, 200);
        assert!((bbox.x - 0.25).abs() < 1e-6);
        assert!((bbox.y - 0.25).abs() < 1e-6);
        assert!((bbox.width - 0.5).abs() < 1e-6);
        assert!((bbox.height - 0.5).abs() < 1e-6);
    }

    #[test]
    fn empty_poly_collapses_to_zero() {
        let poly = WirePoly::default();
        let bbox = bbox_from_normalized(&poly);
        assert_eq!(bbox.width, 0.0);
        assert_eq!(bbox.height, 0.0);
    }

    #[test]
    fn wire_response_parses_partial_payload() {
        let json = r#"{
            "responses": [{
                "labelAnnotations": [
                    {"description": "Tree", "score": 0.97, "topicality": 0.95}
                ],
                "error": {"code": 13, "message": "face backend unavailable"}
            }]
        }"#;
        let parsed: WireAnnotateResponse = serde_json::from_str(json).unwrap();
        let response = &parsed.responses[0];
        assert_eq!(response.label_annotations.as_ref().unwrap().len(), 1);
        assert!(response.face_annotations.is_none());
        assert_eq!(response.error.as_ref().unwrap().code, 13);
    }
}
