// Label taxonomy
//
// A fixed keyword table maps provider labels onto five natural-element
// categories. Matching is case-insensitive substring over the normalized
// label. A label matching several categories is split evenly across them
// before the per-category dampening factor applies.

use crate::core::types::{ElementCategory, LabelAnnotation};

/// Keywords per category. A label belongs to a category when any keyword is
/// a substring of the lowercased label text.
pub fn keywords(category: ElementCategory) -> &'static [&'static str] {
    match category {
        ElementCategory::Vegetation => &[
            "tree", "plant", "grass", "leaf", "flower", "shrub", "bush", "forest", "foliage",
            "garden", "vegetation", "fern", "moss", "vine", "branch", "trunk", "greenery",
            "flora", "botanical", "herb", "bamboo", "meadow", "lawn",
        ],
        ElementCategory::Sky => &[
            "sky", "cloud", "atmosphere", "sunset", "sunrise", "horizon", "overcast", "cumulus",
            "cirrus", "dusk", "dawn",
        ],
        ElementCategory::Water => &[
            "water", "lake", "river", "pond", "stream", "fountain", "sea", "waterfall", "creek",
            "brook", "canal", "reservoir", "wetland", "pool",
        ],
        ElementCategory::Terrain => &[
            "ground", "soil", "rock", "stone", "path", "trail", "dirt", "sand", "gravel",
            "earth", "mud", "cliff", "hill", "boulder",
        ],
        ElementCategory::Built => &[
            "building", "bench", "fence", "structure", "pavement", "road", "sidewalk", "bridge",
            "wall", "gate", "pavilion", "gazebo", "playground", "statue", "monument", "sign",
            "lamp", "post",
        ],
    }
}

/// Dampening factor applied to each category's weighted sum; verbose
/// categories would otherwise overcount.
pub fn alpha(category: ElementCategory) -> f32 {
    match category {
        ElementCategory::Vegetation => 1.0,
        ElementCategory::Sky => 0.8,
        ElementCategory::Water => 0.7,
        ElementCategory::Terrain => 0.5,
        ElementCategory::Built => 0.6,
    }
}

/// One label attributed to one category, with its share of the label's
/// confidence (split across multi-category matches) and the dampened
/// contribution used for coverage math.
#[derive(Debug, Clone)]
pub struct CategorizedLabel {
    pub category: ElementCategory,
    pub label: String,
    pub confidence: f32,
    /// confidence / number_of_matching_categories
    pub share: f32,
    /// share * alpha(category)
    pub weighted: f32,
}

pub fn categories_for(label: &str) -> Vec<ElementCategory> {
    let normalized = label.to_lowercase();
    ElementCategory::ALL
        .iter()
        .copied()
        .filter(|category| {
            keywords(*category)
                .iter()
                .any(|keyword| normalized.contains(keyword))
        })
        .collect()
}

/// Categorize labels, discarding those below the confidence threshold
/// before any attribution happens.
pub fn categorize(labels: &[LabelAnnotation], confidence_threshold: f32) -> Vec<CategorizedLabel> {
    let mut out = Vec::new();
    for label in labels {
        if label.confidence < confidence_threshold {
            continue;
        }
        let matched = categories_for(&label.description);
        if matched.is_empty() {
            continue;
        }
        let share = label.confidence / matched.len() as f32;
        for category in matched {
            out.push(CategorizedLabel {
                category,
                label: label.description.clone(),
                confidence: label.confidence,
                share,
                weighted: share * alpha(category),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(description: &str, confidence: f32) -> LabelAnnotation {
        LabelAnnotation {
            description: description.to_string(),
            confidence,
            topicality: confidence,
        }
    }

    #[test]
    fn single_category_match() {
        let matched = categories_for("Oak tree");
        assert_eq!(matched, vec![ElementCategory::Vegetation]);
    }

    #[test]
    fn substring_matching_is_case_insensitive() {
        assert_eq!(categories_for("BLUE SKY"), vec![ElementCategory::Sky]);
        assert_eq!(categories_for("Riverbank"), vec![ElementCategory::Water]);
    }

    #[test]
    fn ambiguous_label_splits_confidence_evenly() {
        // "waterfall rock" hits both water and terrain
        let categorized = categorize(&[label("waterfall rock", 0.8)], 0.3);
        assert_eq!(categorized.len(), 2);
        for c in &categorized {
            assert!((c.share - 0.4).abs() < 1e-6);
        }
        let total_share: f32 = categorized.iter().map(|c| c.share).sum();
        assert!((total_share - 0.8).abs() < 1e-6);
    }

    #[test]
    fn low_confidence_labels_are_discarded() {
        let categorized = categorize(&[label("tree", 0.2)], 0.3);
        assert!(categorized.is_empty());
    }

    #[test]
    fn unmatched_labels_are_skipped() {
        let categorized = categorize(&[label("bicycle", 0.9)], 0.3);
        assert!(categorized.is_empty());
    }

    #[test]
    fn dampening_applies_per_category() {
        let categorized = categorize(&[label("sky", 1.0)], 0.3);
        assert_eq!(categorized.len(), 1);
        assert!((categorized[0].weighted - 0.8).abs() < 1e-6);
    }
}
