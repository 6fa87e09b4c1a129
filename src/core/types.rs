// Domain types for the analysis pipeline
//
// Artifacts are a tagged union over result kinds; the envelope carries the
// kind explicitly so clients never sniff shapes. Artifact bodies are
// immutable once cached; callers receive Arc'd values and must not expect
// in-place mutation to be visible anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Result kinds understood by the cache and the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Detect,
    Faces,
    Nature,
    Annotate,
    Segment,
    Extract,
    Batch,
}

impl ResultKind {
    pub const ALL: [ResultKind; 7] = [
        ResultKind::Detect,
        ResultKind::Faces,
        ResultKind::Nature,
        ResultKind::Annotate,
        ResultKind::Segment,
        ResultKind::Extract,
        ResultKind::Batch,
    ];

    /// Cache key prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::Faces => "faces",
            Self::Nature => "nature",
            Self::Annotate => "annotate",
            Self::Segment => "segment",
            Self::Extract => "extract",
            Self::Batch => "batch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detect" | "labels" | "objects" => Some(Self::Detect),
            "faces" => Some(Self::Faces),
            "nature" => Some(Self::Nature),
            "annotate" => Some(Self::Annotate),
            "segment" => Some(Self::Segment),
            "extract" => Some(Self::Extract),
            "batch" => Some(Self::Batch),
            _ => None,
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Metadata record for one stored image, keyed by its content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// 32-hex lowercase MD5 of the upload bytes
    pub image_hash: String,
    /// 16-hex 64-bit perceptual signature
    pub perceptual_hash: String,
    pub filename: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub blob_url: String,
    pub width: u32,
    pub height: u32,
    pub upload_time: DateTime<Utc>,
}

/// Outcome of an ingest, discriminated for the upload response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// New blob written, metadata created
    Stored,
    /// Exact content-hash match; prior record returned
    Duplicate,
    /// No exact match but perceptually similar records exist; new record stored
    Similar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarImage {
    pub image_hash: String,
    pub perceptual_hash: String,
    pub hamming_distance: u32,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub is_duplicate: bool,
    pub record: ImageRecord,
    pub similar_images: Vec<SimilarImage>,
}

/// Normalized bounding box, all coordinates clamped to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn clamped(x: f32, y: f32, width: f32, height: f32) -> Self {
        let x = x.clamp(0.0, 1.0);
        let y = y.clamp(0.0, 1.0);
        Self {
            x,
            y,
            width: width.clamp(0.0, 1.0 - x),
            height: height.clamp(0.0, 1.0 - y),
        }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }

    pub fn area_pct(&self) -> f32 {
        self.width * self.height * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// One localized object detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub object_id: String,
    pub class_name: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub center: Point,
    pub area_pct: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionArtifact {
    pub detections: Vec<Detection>,
    /// Raw labels that rode along with the detection request
    pub labels: Vec<LabelAnnotation>,
    /// Safe-search verdicts, informational only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_search: Option<SafeSearch>,
    /// False when the vision provider was unreachable and this is a
    /// degraded empty result; clients surface degraded mode instead of
    /// retrying.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelAnnotation {
    pub description: String,
    pub confidence: f32,
    pub topicality: f32,
}

/// Likelihood buckets as the vision provider reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Likelihood {
    Unknown,
    VeryUnlikely,
    Unlikely,
    Possible,
    Likely,
    VeryLikely,
}

impl Likelihood {
    pub fn parse(s: &str) -> Self {
        match s {
            "VERY_UNLIKELY" => Self::VeryUnlikely,
            "UNLIKELY" => Self::Unlikely,
            "POSSIBLE" => Self::Possible,
            "LIKELY" => Self::Likely,
            "VERY_LIKELY" => Self::VeryLikely,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceLandmark {
    pub kind: String,
    pub position: Point,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Face {
    pub face_id: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub center: Point,
    pub landmarks: Vec<FaceLandmark>,
    pub anger: Likelihood,
    pub joy: Likelihood,
    pub sorrow: Likelihood,
    pub surprise: Likelihood,
    pub blurred: Likelihood,
    pub headwear: Likelihood,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceArtifact {
    pub faces: Vec<Face>,
    pub total_faces: usize,
    /// False when the vision provider was unreachable (degraded mode)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeSearch {
    pub adult: Likelihood,
    pub violence: Likelihood,
    pub racy: Likelihood,
}

/// Natural element categories the label taxonomy maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementCategory {
    Vegetation,
    Sky,
    Water,
    Terrain,
    Built,
}

impl ElementCategory {
    pub const ALL: [ElementCategory; 5] = [
        ElementCategory::Vegetation,
        ElementCategory::Sky,
        ElementCategory::Water,
        ElementCategory::Terrain,
        ElementCategory::Built,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Vegetation => "vegetation",
            Self::Sky => "sky",
            Self::Water => "water",
            Self::Terrain => "terrain",
            Self::Built => "built",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    pub category: ElementCategory,
    pub coverage_pct: f32,
    pub avg_confidence: f32,
    pub detected_labels: Vec<String>,
    pub element_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VegetationHealth {
    /// 0-100 composite
    pub overall_score: f32,
    pub color_score: f32,
    pub coverage_score: f32,
    pub label_score: f32,
    pub green_ratio: f32,
    /// healthy / moderate / poor / unknown
    pub status: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonalAnalysis {
    /// Season name or "unknown"
    pub primary_season: String,
    pub confidence_by_season: HashMap<String, f32>,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DominantColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub hex: String,
    pub name: String,
    pub pct: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatureArtifact {
    /// Per-category coverage percentages; together they sum to <= 100 (+eps)
    pub coverage: HashMap<ElementCategory, f32>,
    pub categories: Vec<CategoryBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vegetation_health: Option<VegetationHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seasonal: Option<SeasonalAnalysis>,
    pub dominant_colors: Vec<DominantColor>,
    pub color_diversity_score: f32,
    pub overall_assessment: String,
    pub recommendations: Vec<String>,
    pub total_labels_analyzed: usize,
    /// False when the vision provider was unreachable (degraded mode)
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub mean: f32,
    pub min: f32,
    pub max: f32,
    /// >= 0.8
    pub high: usize,
    /// [0.5, 0.8)
    pub medium: usize,
    /// < 0.5
    pub low: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationStats {
    pub total_objects: usize,
    pub total_faces: usize,
    pub class_histogram: HashMap<String, usize>,
    pub confidence: ConfidenceStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedImageArtifact {
    pub annotation_id: String,
    pub blob_url: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub stats: AnnotationStats,
}

/// Output encodings the renderer supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpg,
    Webp,
}

impl ImageFormat {
    pub fn ext(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

/// The discriminated union the cache stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisArtifact {
    Detect(DetectionArtifact),
    Faces(FaceArtifact),
    Nature(NatureArtifact),
    Annotate(AnnotatedImageArtifact),
}

impl AnalysisArtifact {
    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Detect(_) => ResultKind::Detect,
            Self::Faces(_) => ResultKind::Faces,
            Self::Nature(_) => ResultKind::Nature,
            Self::Annotate(_) => ResultKind::Annotate,
        }
    }
}

/// Caller-visible parameters for detect/faces analysis. Everything here
/// participates in the cache fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeParams {
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_true")]
    pub include_labels: bool,
    #[serde(default = "default_true")]
    pub include_faces: bool,
}

fn default_confidence() -> f32 {
    0.5
}

fn default_max_results() -> usize {
    50
}

fn default_true() -> bool {
    true
}

impl Default for AnalyzeParams {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence(),
            max_results: default_max_results(),
            include_labels: true,
            include_faces: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDepth {
    Basic,
    Comprehensive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatureParams {
    #[serde(default = "default_depth")]
    pub depth: AnalysisDepth,
    #[serde(default = "default_true")]
    pub include_health: bool,
    #[serde(default = "default_true")]
    pub include_seasonal: bool,
    #[serde(default = "default_true")]
    pub include_color: bool,
    #[serde(default = "default_analyzer_confidence")]
    pub confidence_threshold: f32,
}

fn default_depth() -> AnalysisDepth {
    AnalysisDepth::Comprehensive
}

fn default_analyzer_confidence() -> f32 {
    0.3
}

impl Default for NatureParams {
    fn default() -> Self {
        Self {
            depth: AnalysisDepth::Comprehensive,
            include_health: true,
            include_seasonal: true,
            include_color: true,
            confidence_threshold: default_analyzer_confidence(),
        }
    }
}

/// Styling knobs for the annotation renderer. Part of the annotate
/// fingerprint, so every field affects the cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderStyle {
    #[serde(default = "default_face_marker_color")]
    pub face_marker_color: String,
    #[serde(default = "default_face_marker_radius")]
    pub face_marker_radius: u32,
    #[serde(default = "default_box_color")]
    pub box_color: String,
    #[serde(default = "default_box_thickness")]
    pub box_thickness: u32,
    #[serde(default = "default_label_color")]
    pub label_color: String,
    #[serde(default = "default_label_font_px")]
    pub label_font_px: u32,
    #[serde(default = "default_connector_color")]
    pub connector_color: String,
    #[serde(default = "default_text_bg")]
    pub text_bg: String,
    #[serde(default = "default_text_alpha")]
    pub text_alpha: u8,
}

fn default_face_marker_color() -> String {
    "#FFD700".to_string()
}

fn default_face_marker_radius() -> u32 {
    8
}

fn default_box_color() -> String {
    "#FFFFFF".to_string()
}

fn default_box_thickness() -> u32 {
    2
}

fn default_label_color() -> String {
    "#0066CC".to_string()
}

fn default_label_font_px() -> u32 {
    14
}

fn default_connector_color() -> String {
    "#0066CC".to_string()
}

fn default_text_bg() -> String {
    "#000000".to_string()
}

fn default_text_alpha() -> u8 {
    160
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            face_marker_color: default_face_marker_color(),
            face_marker_radius: default_face_marker_radius(),
            box_color: default_box_color(),
            box_thickness: default_box_thickness(),
            label_color: default_label_color(),
            label_font_px: default_label_font_px(),
            connector_color: default_connector_color(),
            text_bg: default_text_bg(),
            text_alpha: default_text_alpha(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    #[serde(default = "default_true")]
    pub include_faces: bool,
    #[serde(default = "default_true")]
    pub include_boxes: bool,
    #[serde(default = "default_true")]
    pub include_labels: bool,
    #[serde(default = "default_format")]
    pub format: ImageFormat,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub style: RenderStyle,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,
}

fn default_format() -> ImageFormat {
    ImageFormat::Png
}

fn default_quality() -> u8 {
    95
}

fn default_max_objects() -> usize {
    20
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            include_faces: true,
            include_boxes: true,
            include_labels: true,
            format: ImageFormat::Png,
            quality: default_quality(),
            style: RenderStyle::default(),
            confidence_threshold: default_confidence(),
            max_objects: default_max_objects(),
        }
    }
}

/// Uniform response wrapper for every analysis operation.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub from_cache: bool,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(result: T, from_cache: bool, processing_time_ms: u64) -> Self {
        Self {
            success: true,
            from_cache,
            processing_time_ms,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: &crate::core::errors::ApiError, processing_time_ms: u64) -> Self {
        Self {
            success: false,
            from_cache: false,
            processing_time_ms,
            result: None,
            error: Some(EnvelopeError {
                code: error.code().to_string(),
                message: error.to_string(),
                details: None,
                retry_after_seconds: error.retry_after_seconds(),
            }),
        }
    }
}

/// Per-item outcome inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub image_hash: String,
    pub kind: ResultKind,
    pub success: bool,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<AnalysisArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchItemError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemError {
    pub error_code: String,
    pub error_message: String,
    pub retry_hint: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub partial: bool,
    pub cache_hit_count: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub summary: BatchSummary,
    /// Aligned to the input (image x kind) cartesian product
    pub items: Vec<BatchItemResult>,
}
