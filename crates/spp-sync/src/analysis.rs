use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use spp_core::{Category, CategoryScheme, StudentRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BullyingTypeSummary {
    pub counts: BTreeMap<String, usize>,
    pub most_frequent: Option<String>,
    pub least_frequent: Option<String>,
}

/// Untagged records are not counted. Ties go to the alphabetically first type.
pub fn bullying_type_summary(records: &[StudentRecord]) -> BullyingTypeSummary {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for kind in records.iter().filter_map(|r| r.profile.bullying_type.as_deref()) {
        *counts.entry(kind.to_string()).or_default() += 1;
    }

    // BTreeMap iterates alphabetically; keep the first of equal counts.
    let mut most: Option<(&String, usize)> = None;
    let mut least: Option<(&String, usize)> = None;
    for (kind, &count) in &counts {
        if most.map_or(true, |(_, best)| count > best) {
            most = Some((kind, count));
        }
        if least.map_or(true, |(_, best)| count < best) {
            least = Some((kind, count));
        }
    }

    BullyingTypeSummary {
        most_frequent: most.map(|(k, _)| k.clone()),
        least_frequent: least.map(|(k, _)| k.clone()),
        counts,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryShare {
    pub category: Category,
    pub count: usize,
    pub percent: f64,
}

/// One entry per category of `scheme`, in rank order, zero counts included.
pub fn category_distribution(records: &[StudentRecord], scheme: CategoryScheme) -> Vec<CategoryShare> {
    let total = records.len();
    scheme
        .categories()
        .iter()
        .map(|&category| {
            let count = records.iter().filter(|r| r.category == category).count();
            let percent = if total == 0 {
                0.0
            } else {
                count as f64 * 100.0 / total as f64
            };
            CategoryShare {
                category,
                count,
                percent,
            }
        })
        .collect()
}

/// Distinct names still waiting for an observed score, in store order.
pub fn pending_actuals(records: &[StudentRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| r.actual_performance.is_none())
        .map(|r| r.identity_key().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryAnalysis {
    pub total_records: usize,
    pub mean_predicted: Option<f64>,
    pub bullying_types: BullyingTypeSummary,
    pub categories: Vec<CategoryShare>,
    pub pending_actuals: Vec<String>,
}

pub fn analyze(records: &[StudentRecord], scheme: CategoryScheme) -> HistoryAnalysis {
    let mean_predicted = (!records.is_empty())
        .then(|| records.iter().map(|r| r.predicted_score).sum::<f64>() / records.len() as f64);
    HistoryAnalysis {
        total_records: records.len(),
        mean_predicted,
        bullying_types: bullying_type_summary(records),
        categories: category_distribution(records, scheme),
        pending_actuals: pending_actuals(records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spp_core::{CompositeScores, Gender, StudentProfile};

    fn record(name: &str, kind: Option<&str>, score: f64, actual: Option<f64>) -> StudentRecord {
        let mut r = StudentRecord::scored(
            StudentProfile {
                name: name.into(),
                gender: Gender::Male,
                age: 14,
                grade: 8,
                bullying_type: kind.map(String::from),
            },
            CompositeScores::new(3.0, 3.0, 3.0),
            score,
            CategoryScheme::ThreeTier,
        );
        r.actual_performance = actual;
        r
    }

    #[test]
    fn bullying_types_rank_with_alphabetical_ties() {
        let records = vec![
            record("A", Some("Verbal"), 3.0, None),
            record("B", Some("Cyber"), 3.0, None),
            record("C", Some("Verbal"), 3.0, None),
            record("D", Some("Physical"), 3.0, None),
            record("E", None, 3.0, None),
        ];
        let summary = bullying_type_summary(&records);
        assert_eq!(summary.counts.get("Verbal"), Some(&2));
        assert_eq!(summary.counts.len(), 3);
        assert_eq!(summary.most_frequent.as_deref(), Some("Verbal"));
        assert_eq!(summary.least_frequent.as_deref(), Some("Cyber"));
    }

    #[test]
    fn empty_history_has_no_extremes() {
        let summary = bullying_type_summary(&[]);
        assert_eq!(summary, BullyingTypeSummary::default());
        let dist = category_distribution(&[], CategoryScheme::FourTier);
        assert_eq!(dist.len(), 4);
        assert!(dist.iter().all(|s| s.count == 0 && s.percent == 0.0));
        assert_eq!(analyze(&[], CategoryScheme::ThreeTier).mean_predicted, None);
    }

    #[test]
    fn distribution_covers_every_category() {
        let records = vec![
            record("A", None, 2.0, None),
            record("B", None, 3.0, None),
            record("C", None, 4.0, None),
            record("D", None, 4.5, None),
        ];
        let dist = category_distribution(&records, CategoryScheme::ThreeTier);
        let counts: Vec<_> = dist.iter().map(|s| (s.category, s.count)).collect();
        assert_eq!(
            counts,
            vec![(Category::Low, 1), (Category::Moderate, 1), (Category::High, 2)]
        );
        assert_eq!(dist[2].percent, 50.0);
    }

    #[test]
    fn pending_actuals_are_distinct_names() {
        let records = vec![
            record("Ayu", None, 3.0, None),
            record("Budi", None, 3.0, Some(3.1)),
            record("Ayu ", None, 3.0, None),
            record("Citra", None, 3.0, None),
        ];
        assert_eq!(pending_actuals(&records), vec!["Ayu".to_string(), "Citra".to_string()]);
    }
}
