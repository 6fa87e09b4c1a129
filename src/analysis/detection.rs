// Detection and face artifact transforms
//
// Turns raw vision primitives into the typed artifacts the cache stores.
// Object ids are stable sequential indices so equal bundles always produce
// equal artifacts.

use crate::core::types::{
    AnalyzeParams, Detection, DetectionArtifact, Face, FaceArtifact, FaceLandmark, Point,
};
use crate::vision::types::PrimitiveBundle;

pub fn detection_artifact(bundle: &PrimitiveBundle, params: &AnalyzeParams) -> DetectionArtifact {
    let mut detections: Vec<Detection> = bundle
        .objects
        .iter()
        .filter(|o| o.score >= params.confidence_threshold)
        .enumerate()
        .map(|(idx, o)| Detection {
            object_id: format!("obj_{idx}"),
            class_name: o.name.clone(),
            confidence: o.score,
            bounding_box: o.bbox,
            center: o.bbox.center(),
            area_pct: o.bbox.area_pct(),
        })
        .collect();

    // Highest confidence first; index tiebreak keeps ordering total
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });
    detections.truncate(params.max_results);

    DetectionArtifact {
        detections,
        labels: if params.include_labels {
            bundle.labels.clone()
        } else {
            vec![]
        },
        safe_search: bundle.safe_search.clone(),
        enabled: true,
    }
}

pub fn face_artifact(bundle: &PrimitiveBundle, params: &AnalyzeParams) -> FaceArtifact {
    let faces: Vec<Face> = bundle
        .faces
        .iter()
        .filter(|f| f.confidence >= params.confidence_threshold)
        .enumerate()
        .map(|(idx, f)| Face {
            face_id: format!("face_{idx}"),
            confidence: f.confidence,
            bounding_box: f.bbox,
            center: f.bbox.center(),
            landmarks: f
                .landmarks
                .iter()
                .map(|l| FaceLandmark {
                    kind: l.kind.clone(),
                    position: Point { x: l.x, y: l.y },
                })
                .collect(),
            anger: f.anger,
            joy: f.joy,
            sorrow: f.sorrow,
            surprise: f.surprise,
            blurred: f.blurred,
            headwear: f.headwear,
        })
        .collect();

    FaceArtifact {
        total_faces: faces.len(),
        faces,
        enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BoundingBox, Likelihood};
    use crate::vision::types::{RawFace, RawObject};

    fn object(name: &str, score: f32) -> RawObject {
        RawObject {
            name: name.to_string(),
            score,
            bbox: BoundingBox::clamped(0.1, 0.1, 0.3, 0.3),
        }
    }

    fn face(confidence: f32) -> RawFace {
        RawFace {
            confidence,
            bbox: BoundingBox::clamped(0.4, 0.4, 0.1, 0.1),
            landmarks: vec![],
            anger: Likelihood::VeryUnlikely,
            joy: Likelihood::Likely,
            sorrow: Likelihood::VeryUnlikely,
            surprise: Likelihood::Unlikely,
            blurred: Likelihood::VeryUnlikely,
            headwear: Likelihood::Unknown,
        }
    }

    #[test]
    fn detection_filters_sorts_and_caps() {
        let bundle = PrimitiveBundle {
            objects: vec![
                object("bench", 0.4),
                object("tree", 0.95),
                object("fountain", 0.7),
                object("duck", 0.2),
            ],
            ..Default::default()
        };
        let params = AnalyzeParams {
            confidence_threshold: 0.3,
            max_results: 2,
            ..Default::default()
        };
        let artifact = detection_artifact(&bundle, &params);
        assert_eq!(artifact.detections.len(), 2);
        assert_eq!(artifact.detections[0].class_name, "tree");
        assert_eq!(artifact.detections[1].class_name, "fountain");
        assert!(artifact.detections.iter().all(|d| d.confidence >= 0.3));
    }

    #[test]
    fn detection_geometry_is_derived() {
        let bundle = PrimitiveBundle {
            objects: vec![object("tree", 0.9)],
            ..Default::default()
        };
        let artifact = detection_artifact(&bundle, &AnalyzeParams::default());
        let d = &artifact.detections[0];
        assert!((d.center.x - 0.25).abs() < 1e-6);
        assert!((d.area_pct - 9.0).abs() < 1e-3);
    }

    #[test]
    fn labels_can_be_excluded() {
        let bundle = PrimitiveBundle {
            labels: vec![crate::core::types::LabelAnnotation {
                description: "Tree".to_string(),
                confidence: 0.9,
                topicality: 0.9,
            }],
            ..Default::default()
        };
        let params = AnalyzeParams {
            include_labels: false,
            ..Default::default()
        };
        assert!(detection_artifact(&bundle, &params).labels.is_empty());
    }

    #[test]
    fn faces_filter_by_confidence() {
        let bundle = PrimitiveBundle {
            faces: vec![face(0.9), face(0.3)],
            ..Default::default()
        };
        let artifact = face_artifact(&bundle, &AnalyzeParams::default());
        assert_eq!(artifact.total_faces, 1);
        assert_eq!(artifact.faces[0].face_id, "face_0");
        assert_eq!(artifact.faces[0].joy, Likelihood::Likely);
    }
}
