//! Input normalization: manual form fields, raw CSV uploads and survey exports
//! all become the same canonical scores + descriptive profile.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use spp_core::{
    BullyingSubscores, CompositeScores, FeatureLayout, FeatureVector, Gender, SppError, SppResult,
    StudentProfile,
};
use thiserror::Error;

mod grade;
mod raw_csv;
mod survey;

pub use grade::grade_from_token;
pub use raw_csv::{parse_raw_csv, REQUIRED_COLUMNS};
pub use survey::{
    label_score, parse_survey_labeled, parse_survey_likert, ColumnRange, LabeledColumns,
    LikertRanges, SurveyLayout, FREQUENCY_LABELS,
};

pub const CRATE_NAME: &str = "spp-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceShape {
    Manual,
    RawCsv,
    SurveyLabeled,
    SurveyLikert,
}

impl SourceShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::RawCsv => "raw-csv",
            Self::SurveyLabeled => "survey-labeled",
            Self::SurveyLikert => "survey-likert",
        }
    }
}

impl fmt::Display for SourceShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "raw-csv" | "csv" => Ok(Self::RawCsv),
            "survey-labeled" | "labeled" => Ok(Self::SurveyLabeled),
            "survey-likert" | "likert" => Ok(Self::SurveyLikert),
            other => Err(format!("unknown source shape `{other}`")),
        }
    }
}

/// Inclusive bounds of the questionnaire scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreScale {
    pub min: f64,
    pub max: f64,
}

impl ScoreScale {
    pub const FIVE_POINT: ScoreScale = ScoreScale { min: 1.0, max: 5.0 };
    pub const TEN_POINT: ScoreScale = ScoreScale { min: 1.0, max: 10.0 };

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl Default for ScoreScale {
    fn default() -> Self {
        Self::FIVE_POINT
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing required columns: {}{}", .missing.join(", "), render_suggestions(.suggestions))]
    MissingColumns {
        missing: Vec<String>,
        suggestions: Vec<(String, String)>,
    },
    #[error("please complete the `{0}` field")]
    MissingField(&'static str),
    #[error("row {row}: `{label}` in column `{column}` is not a recognized answer")]
    UnknownLabel {
        row: usize,
        column: String,
        label: String,
    },
    #[error("row {row}: invalid `{column}` value `{value}`: {reason}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
        reason: String,
    },
    #[error("{0} must be a single student, not a batch upload")]
    NotABatch(SourceShape),
    #[error("upload contains no student rows")]
    Empty,
    #[error("malformed delimited file: {0}")]
    Csv(#[from] csv::Error),
}

fn render_suggestions(suggestions: &[(String, String)]) -> String {
    if suggestions.is_empty() {
        return String::new();
    }
    let hints = suggestions
        .iter()
        .map(|(missing, found)| format!("`{found}` for `{missing}`"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" (did you mean {hints}?)")
}

impl From<NormalizeError> for SppError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::MissingColumns { .. } | NormalizeError::Csv(_) | NormalizeError::Empty => {
                SppError::SchemaMismatch(err.to_string())
            }
            _ => SppError::InvalidInput(err.to_string()),
        }
    }
}

/// Canonical scores plus the pass-through descriptive fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedInput {
    pub profile: StudentProfile,
    pub scores: CompositeScores,
    #[serde(default)]
    pub actual_performance: Option<f64>,
}

impl NormalizedInput {
    pub fn features(&self, layout: FeatureLayout) -> SppResult<FeatureVector> {
        self.scores.to_features(layout)
    }
}

/// Form fields from the interactive entry path; scores are already numeric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualInput {
    pub name: String,
    pub gender: Option<Gender>,
    pub age: u32,
    pub grade: u32,
    #[serde(default)]
    pub bullying_type: Option<String>,
    pub bullying: f64,
    pub social_support: f64,
    pub mental_health: f64,
    #[serde(default)]
    pub subscores: Option<BullyingSubscores>,
}

pub const AGE_RANGE: std::ops::RangeInclusive<u32> = 5..=20;
pub const GRADE_RANGE: std::ops::RangeInclusive<u32> = 1..=12;

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    pub scale: ScoreScale,
    pub layout: SurveyLayout,
}

impl Normalizer {
    pub fn new(scale: ScoreScale, layout: SurveyLayout) -> Self {
        Self { scale, layout }
    }

    pub fn manual(&self, input: ManualInput) -> Result<NormalizedInput, NormalizeError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(NormalizeError::MissingField("name"));
        }
        let gender = input.gender.ok_or(NormalizeError::MissingField("gender"))?;
        check_range(0, "age", input.age, &AGE_RANGE)?;
        check_range(0, "grade", input.grade, &GRADE_RANGE)?;

        let mut scores = CompositeScores::new(
            self.scaled(0, "bullying", input.bullying)?,
            self.scaled(0, "social_support", input.social_support)?,
            self.scaled(0, "mental_health", input.mental_health)?,
        );
        if let Some(sub) = input.subscores {
            scores = scores.with_subscores(BullyingSubscores {
                physical: self.scaled(0, "physical_bullying", sub.physical)?,
                verbal: self.scaled(0, "verbal_bullying", sub.verbal)?,
                social: self.scaled(0, "social_bullying", sub.social)?,
                cyber: self.scaled(0, "cyber_bullying", sub.cyber)?,
            });
        }

        Ok(NormalizedInput {
            profile: StudentProfile {
                name: name.to_string(),
                gender,
                age: input.age,
                grade: input.grade,
                bullying_type: input.bullying_type.as_deref().and_then(normalize_bullying_type),
            },
            scores,
            actual_performance: None,
        })
    }

    /// Parses an uploaded delimited file of the given shape.
    pub fn batch(&self, shape: SourceShape, bytes: &[u8]) -> Result<Vec<NormalizedInput>, NormalizeError> {
        let inputs = match shape {
            SourceShape::Manual => return Err(NormalizeError::NotABatch(shape)),
            SourceShape::RawCsv => parse_raw_csv(bytes, self.scale)?,
            SourceShape::SurveyLabeled => parse_survey_labeled(bytes, &self.layout)?,
            SourceShape::SurveyLikert => parse_survey_likert(bytes, &self.layout, self.scale)?,
        };
        if inputs.is_empty() {
            return Err(NormalizeError::Empty);
        }
        Ok(inputs)
    }

    fn scaled(&self, row: usize, column: &str, value: f64) -> Result<f64, NormalizeError> {
        check_scale(row, column, value, self.scale)
    }
}

pub(crate) fn check_scale(row: usize, column: &str, value: f64, scale: ScoreScale) -> Result<f64, NormalizeError> {
    if scale.contains(value) {
        Ok(value)
    } else {
        Err(NormalizeError::InvalidValue {
            row,
            column: column.to_string(),
            value: value.to_string(),
            reason: format!("expected a score between {} and {}", scale.min, scale.max),
        })
    }
}

fn check_range(
    row: usize,
    column: &str,
    value: u32,
    range: &std::ops::RangeInclusive<u32>,
) -> Result<(), NormalizeError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(NormalizeError::InvalidValue {
            row,
            column: column.to_string(),
            value: value.to_string(),
            reason: format!("expected {} to {}", range.start(), range.end()),
        })
    }
}

/// Trimmed, first letter upper-cased and the rest lower-cased. Blank is `None`.
pub fn normalize_bullying_type(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut chars = trimmed.chars();
    let first = chars.next()?;
    let mut out: String = first.to_uppercase().collect();
    out.push_str(&chars.as_str().to_lowercase());
    Some(out)
}

/// Leading whole number of a cell, tolerating `14.0` and trailing units (`14 years`).
pub(crate) fn parse_whole(row: usize, column: &str, raw: &str) -> Result<u32, NormalizeError> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    let rest = &trimmed[digits.len()..];
    let fraction_ok = rest
        .strip_prefix('.')
        .map(|frac| frac.chars().take_while(|c| c.is_ascii_digit()).all(|c| c == '0'))
        .unwrap_or(true);
    match digits.parse::<u32>() {
        Ok(v) if fraction_ok => Ok(v),
        _ => Err(NormalizeError::InvalidValue {
            row,
            column: column.to_string(),
            value: raw.to_string(),
            reason: "expected a whole number".into(),
        }),
    }
}

pub(crate) fn parse_score(row: usize, column: &str, raw: &str) -> Result<f64, NormalizeError> {
    raw.trim().parse::<f64>().map_err(|_| NormalizeError::InvalidValue {
        row,
        column: column.to_string(),
        value: raw.to_string(),
        reason: "expected a number".into(),
    })
}

pub(crate) fn parse_gender(row: usize, column: &str, raw: &str) -> Result<Gender, NormalizeError> {
    Gender::from_alias(raw).ok_or_else(|| NormalizeError::InvalidValue {
        row,
        column: column.to_string(),
        value: raw.to_string(),
        reason: "expected Male/Female (or M/F, L/P)".into(),
    })
}

/// Best header match for a missing column, if one is close enough to be a typo.
pub(crate) fn closest_header(missing: &str, headers: &[String]) -> Option<String> {
    let target = missing.to_lowercase();
    headers
        .iter()
        .map(|h| (strsim::jaro_winkler(&target, &h.to_lowercase()), h))
        .filter(|(score, _)| *score >= 0.85)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, h)| h.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> ManualInput {
        ManualInput {
            name: "  Ayu Lestari ".into(),
            gender: Some(Gender::Female),
            age: 13,
            grade: 7,
            bullying_type: Some(" verbal".into()),
            bullying: 3.0,
            social_support: 4.0,
            mental_health: 2.0,
            subscores: None,
        }
    }

    #[test]
    fn manual_input_passes_scores_through() {
        let input = Normalizer::default().manual(manual()).unwrap();
        assert_eq!(input.profile.name, "Ayu Lestari");
        assert_eq!(input.profile.bullying_type.as_deref(), Some("Verbal"));
        assert_eq!(
            input.features(FeatureLayout::Composite).unwrap().values(),
            &[3.0, 4.0, 2.0]
        );
    }

    #[test]
    fn manual_input_requires_name_and_gender() {
        let mut missing_name = manual();
        missing_name.name = "   ".into();
        assert!(matches!(
            Normalizer::default().manual(missing_name),
            Err(NormalizeError::MissingField("name"))
        ));

        let mut missing_gender = manual();
        missing_gender.gender = None;
        let err = Normalizer::default().manual(missing_gender).unwrap_err();
        assert!(matches!(SppError::from(err), SppError::InvalidInput(_)));
    }

    #[test]
    fn manual_scores_respect_configured_scale() {
        let mut input = manual();
        input.bullying = 8.0;
        assert!(Normalizer::default().manual(input.clone()).is_err());
        let ten = Normalizer::new(ScoreScale::TEN_POINT, SurveyLayout::default());
        assert!(ten.manual(input).is_ok());
    }

    #[test]
    fn manual_is_not_a_batch_shape() {
        let err = Normalizer::default().batch(SourceShape::Manual, b"").unwrap_err();
        assert!(matches!(err, NormalizeError::NotABatch(SourceShape::Manual)));
    }

    #[test]
    fn bullying_type_is_trimmed_and_capitalized() {
        assert_eq!(normalize_bullying_type("  cYBER "), Some("Cyber".into()));
        assert_eq!(normalize_bullying_type("fisik"), Some("Fisik".into()));
        assert_eq!(normalize_bullying_type("   "), None);
    }

    #[test]
    fn whole_numbers_tolerate_units_and_zero_fractions() {
        assert_eq!(parse_whole(1, "Age", "14").unwrap(), 14);
        assert_eq!(parse_whole(1, "Age", "14.0").unwrap(), 14);
        assert_eq!(parse_whole(1, "Age", "14 years").unwrap(), 14);
        assert!(parse_whole(1, "Age", "14.5").is_err());
        assert!(parse_whole(1, "Age", "fourteen").is_err());
    }

    #[test]
    fn shapes_parse_from_cli_names() {
        assert_eq!("raw-csv".parse::<SourceShape>(), Ok(SourceShape::RawCsv));
        assert_eq!("Likert".parse::<SourceShape>(), Ok(SourceShape::SurveyLikert));
        assert!("xlsx".parse::<SourceShape>().is_err());
    }
}
