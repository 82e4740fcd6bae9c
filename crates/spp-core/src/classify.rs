//! Score-to-category classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Low,
    Moderate,
    High,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Moderate => "Moderate",
            Self::High => "High",
            Self::Poor => "Poor",
            Self::Fair => "Fair",
            Self::Good => "Good",
            Self::Excellent => "Excellent",
        }
    }

    /// Position within the category's own scheme, lowest first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Low | Self::Poor => 0,
            Self::Moderate | Self::Fair => 1,
            Self::High | Self::Good => 2,
            Self::Excellent => 3,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [
            Self::Low,
            Self::Moderate,
            Self::High,
            Self::Poor,
            Self::Fair,
            Self::Good,
            Self::Excellent,
        ]
        .into_iter()
        .find(|c| c.label().eq_ignore_ascii_case(label.trim()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Threshold scheme used to label predicted scores. Chosen by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryScheme {
    #[default]
    ThreeTier,
    FourTier,
}

impl CategoryScheme {
    /// Total over all of `f64`. NaN has no ordering, so it lands in the lowest tier.
    pub fn classify(self, score: f64) -> Category {
        if score.is_nan() {
            return self.categories()[0];
        }
        match self {
            Self::ThreeTier => {
                if score < 2.5 {
                    Category::Low
                } else if score < 3.5 {
                    Category::Moderate
                } else {
                    Category::High
                }
            }
            Self::FourTier => {
                if score < 2.5 {
                    Category::Poor
                } else if score < 3.5 {
                    Category::Fair
                } else if score < 4.25 {
                    Category::Good
                } else {
                    Category::Excellent
                }
            }
        }
    }

    pub fn categories(self) -> &'static [Category] {
        match self {
            Self::ThreeTier => &[Category::Low, Category::Moderate, Category::High],
            Self::FourTier => &[
                Category::Poor,
                Category::Fair,
                Category::Good,
                Category::Excellent,
            ],
        }
    }

    /// Re-derives a category from a stored score cell, which may have been
    /// persisted as text. Unparseable cells yield `None`.
    pub fn reclassify_text(self, cell: &str) -> Option<Category> {
        cell.trim().parse::<f64>().ok().map(|score| self.classify(score))
    }
}

impl FromStr for CategoryScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "three-tier" | "3" | "3-tier" => Ok(Self::ThreeTier),
            "four-tier" | "4" | "4-tier" => Ok(Self::FourTier),
            other => Err(format!("unknown category scheme `{other}`")),
        }
    }
}
