// Natural-element analyzer
//
// Transforms a vision primitive bundle into ecology metrics: per-category
// coverage, vegetation health, seasonal inference and color analysis. The
// analyzer is a pure function of its input bundle, which is what allows
// results to live behind a fingerprint-keyed cache.

use crate::analysis::colors;
use crate::analysis::taxonomy::{self, CategorizedLabel};
use crate::core::types::{
    AnalysisDepth, CategoryBreakdown, ElementCategory, NatureArtifact, NatureParams,
    SeasonalAnalysis, VegetationHealth,
};
use crate::vision::types::PrimitiveBundle;
use std::collections::HashMap;

const HEALTHY_LABEL_KEYWORDS: [&str; 5] = ["lush", "verdant", "healthy", "green", "thriving"];

const SEASON_KEYWORDS: [(&str, &[&str]); 4] = [
    (
        "spring",
        &["blossom", "bloom", "sprout", "bud", "new growth"],
    ),
    (
        "summer",
        &["lush", "verdant", "sunflower", "dense", "vibrant"],
    ),
    (
        "autumn",
        &["foliage", "red leaf", "orange", "pumpkin", "fall"],
    ),
    (
        "winter",
        &["snow", "frost", "bare branch", "leafless", "dormant"],
    ),
];

/// Minimum summed confidence for a season to be named primary.
const SEASON_PRIMARY_THRESHOLD: f32 = 0.4;

pub struct NatureAnalyzer;

impl NatureAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, bundle: &PrimitiveBundle, params: &NatureParams) -> NatureArtifact {
        let categorized = taxonomy::categorize(&bundle.labels, params.confidence_threshold);
        let coverage = coverage_percentages(&categorized);
        let categories = category_breakdown(&categorized, &coverage);

        let vegetation_health = if params.include_health
            && categorized
                .iter()
                .any(|c| c.category == ElementCategory::Vegetation)
        {
            Some(vegetation_health(bundle, params, &coverage))
        } else {
            None
        };

        let seasonal = if params.include_seasonal && params.depth == AnalysisDepth::Comprehensive {
            Some(seasonal_analysis(bundle, params.confidence_threshold))
        } else {
            None
        };

        let (dominant_colors, color_diversity_score) = if params.include_color {
            let colors = colors::dominant_colors(&bundle.dominant_colors);
            let diversity = colors::diversity_score(&colors);
            (colors, diversity)
        } else {
            (vec![], 0.0)
        };

        let overall_assessment = overall_assessment(&coverage, &vegetation_health);
        let recommendations = recommendations(&coverage, &vegetation_health, &seasonal);

        let total_labels_analyzed = bundle
            .labels
            .iter()
            .filter(|l| l.confidence >= params.confidence_threshold)
            .count();

        NatureArtifact {
            coverage,
            categories,
            vegetation_health,
            seasonal,
            dominant_colors,
            color_diversity_score,
            overall_assessment,
            recommendations,
            total_labels_analyzed,
            enabled: true,
        }
    }
}

impl Default for NatureAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-category coverage: each category's dampened confidence mass as a
/// share of the total, scaled to percent. Shares of a partition sum to 100,
/// so the invariant "sum <= 100 + eps, each in [0, 100]" holds by
/// construction; clamping guards the degenerate cases.
fn coverage_percentages(categorized: &[CategorizedLabel]) -> HashMap<ElementCategory, f32> {
    let mut sums: HashMap<ElementCategory, f32> = ElementCategory::ALL
        .iter()
        .map(|category| (*category, 0.0))
        .collect();
    for item in categorized {
        *sums.entry(item.category).or_default() += item.weighted;
    }

    let total: f32 = sums.values().sum();
    let mut coverage = HashMap::new();
    for category in ElementCategory::ALL {
        let pct = if total > 0.0 {
            (sums[&category] / total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        coverage.insert(category, pct);
    }

    // Rescale if float accumulation nudged the sum over 100.
    let sum: f32 = coverage.values().sum();
    if sum > 100.0 {
        for value in coverage.values_mut() {
            *value *= 100.0 / sum;
        }
    }
    coverage
}

fn category_breakdown(
    categorized: &[CategorizedLabel],
    coverage: &HashMap<ElementCategory, f32>,
) -> Vec<CategoryBreakdown> {
    ElementCategory::ALL
        .iter()
        .filter_map(|category| {
            let members: Vec<&CategorizedLabel> = categorized
                .iter()
                .filter(|c| c.category == *category)
                .collect();
            if members.is_empty() {
                return None;
            }
            let avg_confidence =
                members.iter().map(|m| m.confidence).sum::<f32>() / members.len() as f32;
            Some(CategoryBreakdown {
                category: *category,
                coverage_pct: coverage.get(category).copied().unwrap_or(0.0),
                avg_confidence,
                detected_labels: members.iter().map(|m| m.label.clone()).collect(),
                element_count: members.len(),
            })
        })
        .collect()
}

/// Composite vegetation health: color 45%, coverage 35%, label evidence 20%.
fn vegetation_health(
    bundle: &PrimitiveBundle,
    params: &NatureParams,
    coverage: &HashMap<ElementCategory, f32>,
) -> VegetationHealth {
    let green_ratio = colors::green_ratio(&bundle.dominant_colors);
    let color_score = 100.0 * (green_ratio / 0.4).min(1.0);

    let vegetation_coverage = coverage
        .get(&ElementCategory::Vegetation)
        .copied()
        .unwrap_or(0.0);
    let coverage_score = 100.0 * (vegetation_coverage / 30.0).min(1.0);

    let healthy_max = bundle
        .labels
        .iter()
        .filter(|l| l.confidence >= params.confidence_threshold)
        .filter(|l| {
            let text = l.description.to_lowercase();
            HEALTHY_LABEL_KEYWORDS.iter().any(|k| text.contains(k))
        })
        .map(|l| l.confidence)
        .fold(0.0f32, f32::max);
    let label_score = 100.0 * healthy_max.min(1.0);

    let overall_score =
        (0.45 * color_score + 0.35 * coverage_score + 0.20 * label_score).clamp(0.0, 100.0);

    let status = if overall_score >= 70.0 {
        "healthy"
    } else if overall_score >= 40.0 {
        "moderate"
    } else if overall_score >= 15.0 {
        "poor"
    } else {
        "unknown"
    };

    let mut recommendations = Vec::new();
    if color_score < 40.0 {
        recommendations.push(
            "Color analysis suggests vegetation may be stressed - check watering and nutrients"
                .to_string(),
        );
    }
    if coverage_score < 40.0 {
        recommendations
            .push("Low vegetation coverage detected - consider increasing plant density".to_string());
    }
    if label_score < 40.0 {
        recommendations.push("Few healthy-vegetation indicators among detected labels".to_string());
    }
    if overall_score >= 70.0 {
        recommendations.push("Vegetation appears healthy and thriving".to_string());
    }

    VegetationHealth {
        overall_score,
        color_score,
        coverage_score,
        label_score,
        green_ratio,
        status: status.to_string(),
        recommendations,
    }
}

/// Sum label confidences per season's keyword set. Primary season is the
/// arg-max when it clears the threshold; ties break by raw match count,
/// then alphabetically.
fn seasonal_analysis(bundle: &PrimitiveBundle, confidence_threshold: f32) -> SeasonalAnalysis {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut features: Vec<String> = Vec::new();

    for (season, keywords) in SEASON_KEYWORDS {
        scores.insert(season.to_string(), 0.0);
        counts.insert(season, 0);
        for label in &bundle.labels {
            if label.confidence < confidence_threshold {
                continue;
            }
            let text = label.description.to_lowercase();
            if keywords.iter().any(|k| text.contains(k)) {
                *scores.entry(season.to_string()).or_default() += label.confidence;
                *counts.entry(season).or_default() += 1;
                let feature = format!("{season}: {text}");
                if !features.contains(&feature) {
                    features.push(feature);
                }
            }
        }
    }

    let mut ranked: Vec<(&str, f32, usize)> = SEASON_KEYWORDS
        .iter()
        .map(|(season, _)| (*season, scores[*season], counts[season]))
        .collect();
    // Highest score first; ties by match count, then name
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.2.cmp(&a.2))
            .then(a.0.cmp(b.0))
    });

    let primary_season = match ranked.first() {
        Some((season, score, _)) if *score >= SEASON_PRIMARY_THRESHOLD => season.to_string(),
        _ => "unknown".to_string(),
    };

    SeasonalAnalysis {
        primary_season,
        confidence_by_season: scores,
        features,
    }
}

fn overall_assessment(
    coverage: &HashMap<ElementCategory, f32>,
    health: &Option<VegetationHealth>,
) -> String {
    let vegetation = coverage[&ElementCategory::Vegetation];
    let water = coverage[&ElementCategory::Water];
    let built = coverage[&ElementCategory::Built];

    if vegetation > 60.0 {
        if health.as_ref().map_or(false, |h| h.overall_score > 75.0) {
            "thriving_natural_environment".to_string()
        } else {
            "nature_dominant".to_string()
        }
    } else if vegetation > 30.0 {
        if water > 20.0 {
            "balanced_environment_with_water".to_string()
        } else {
            "balanced_environment".to_string()
        }
    } else if built > 50.0 {
        "urban_environment".to_string()
    } else if water > 40.0 {
        "water_dominant_environment".to_string()
    } else {
        "mixed_landscape".to_string()
    }
}

fn recommendations(
    coverage: &HashMap<ElementCategory, f32>,
    health: &Option<VegetationHealth>,
    seasonal: &Option<SeasonalAnalysis>,
) -> Vec<String> {
    let mut out = Vec::new();
    let vegetation = coverage[&ElementCategory::Vegetation];

    if vegetation < 20.0 {
        out.push(
            "Consider increasing vegetation coverage for better environmental balance".to_string(),
        );
    } else if vegetation > 80.0 {
        out.push(
            "Excellent vegetation coverage - maintain current green space management".to_string(),
        );
    }

    if let Some(health) = health {
        if health.overall_score < 50.0 {
            out.push(
                "Vegetation health needs attention - consider soil and water management"
                    .to_string(),
            );
        } else if health.overall_score > 80.0 {
            out.push(
                "Vegetation appears very healthy - continue current maintenance practices"
                    .to_string(),
            );
        }
    }

    if coverage[&ElementCategory::Water] > 30.0 {
        out.push(
            "Significant water features detected - monitor water quality and ecosystem health"
                .to_string(),
        );
    }

    if let Some(seasonal) = seasonal {
        match seasonal.primary_season.as_str() {
            "winter" => {
                out.push("Winter conditions detected - consider seasonal maintenance needs".to_string())
            }
            "spring" => out.push(
                "Spring growth period - optimal time for planting and maintenance".to_string(),
            ),
            "summer" => {
                out.push("Summer conditions - ensure adequate watering and shade".to_string())
            }
            "autumn" => out.push(
                "Autumn season - prepare for seasonal changes and leaf management".to_string(),
            ),
            _ => {}
        }
    }

    if coverage[&ElementCategory::Built] > 60.0 {
        out.push("High built environment coverage - consider adding more green spaces".to_string());
    }

    out
}
