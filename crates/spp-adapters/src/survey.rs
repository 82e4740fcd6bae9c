//! Survey-form exports: one shape with a frequency label per dimension, one
//! with Likert items that are averaged into the composites.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use spp_core::{CompositeScores, StudentProfile};

use crate::raw_csv::{is_blank, reader, HeaderIndex};
use crate::{
    check_scale, grade_from_token, normalize_bullying_type, parse_gender, parse_score, parse_whole,
    NormalizeError, NormalizedInput, ScoreScale,
};

pub const FREQUENCY_LABELS: [&str; 5] = ["Never", "Rarely", "Sometimes", "Often", "Very Often"];

/// Exact (trimmed) label lookup onto the 1..5 scale.
pub fn label_score(label: &str) -> Option<f64> {
    let label = label.trim();
    FREQUENCY_LABELS
        .iter()
        .position(|known| *known == label)
        .map(|i| (i + 1) as f64)
}

/// Half-open range of zero-based column positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRange {
    pub start: usize,
    pub end: usize,
}

impl ColumnRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabeledColumns {
    pub name: String,
    pub gender: String,
    pub age: String,
    pub grade: String,
    pub bullying: String,
    pub social_support: String,
    pub mental_health: String,
    pub bullying_type: String,
}

impl Default for LabeledColumns {
    fn default() -> Self {
        Self {
            name: "Name".into(),
            gender: "Gender".into(),
            age: "Age".into(),
            grade: "Class".into(),
            bullying: "Bullying Frequency".into(),
            social_support: "Social Support Frequency".into(),
            mental_health: "Mental Wellbeing Frequency".into(),
            bullying_type: "Bullying Type".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikertRanges {
    pub name: usize,
    pub gender: usize,
    pub age: usize,
    pub grade: usize,
    pub bullying: ColumnRange,
    pub social_support: ColumnRange,
    pub mental_health: ColumnRange,
    pub bullying_type: Option<usize>,
}

impl Default for LikertRanges {
    fn default() -> Self {
        // Column 0 is the form timestamp.
        Self {
            name: 1,
            gender: 2,
            age: 3,
            grade: 4,
            bullying: ColumnRange::new(5, 10),
            social_support: ColumnRange::new(10, 15),
            mental_health: ColumnRange::new(15, 20),
            bullying_type: Some(20),
        }
    }
}

impl LikertRanges {
    fn required(&self) -> Vec<(String, usize)> {
        let mut needed = vec![
            ("name".to_string(), self.name),
            ("gender".to_string(), self.gender),
            ("age".to_string(), self.age),
            ("grade".to_string(), self.grade),
        ];
        for (label, range) in [
            ("bullying items", self.bullying),
            ("social support items", self.social_support),
            ("mental health items", self.mental_health),
        ] {
            if let Some(last) = range.end.checked_sub(1) {
                needed.push((label.to_string(), last));
            }
        }
        if let Some(i) = self.bullying_type {
            needed.push(("bullying type".to_string(), i));
        }
        needed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyLayout {
    pub labeled: LabeledColumns,
    pub likert: LikertRanges,
}

impl SurveyLayout {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let layout: Self = serde_yaml::from_str(text).context("parsing survey layout")?;
        for (label, range) in [
            ("bullying", layout.likert.bullying),
            ("social_support", layout.likert.social_support),
            ("mental_health", layout.likert.mental_health),
        ] {
            anyhow::ensure!(!range.is_empty(), "likert range `{label}` selects no columns");
        }
        Ok(layout)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading survey layout {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

pub fn parse_survey_labeled(
    bytes: &[u8],
    layout: &SurveyLayout,
) -> Result<Vec<NormalizedInput>, NormalizeError> {
    let cols = &layout.labeled;
    let mut rdr = reader(bytes);
    let index = HeaderIndex::new(rdr.headers()?);
    let [name, gender, age, grade, bullying, support, mental] = index.require([
        cols.name.as_str(),
        cols.gender.as_str(),
        cols.age.as_str(),
        cols.grade.as_str(),
        cols.bullying.as_str(),
        cols.social_support.as_str(),
        cols.mental_health.as_str(),
    ])?;
    let kind = index.position(&cols.bullying_type);

    let mut out = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        if is_blank(&record) {
            continue;
        }
        let row = i + 2;
        let cell = |idx: usize| record.get(idx).unwrap_or("");
        let labeled = |idx: usize, column: &str| {
            label_score(cell(idx)).ok_or_else(|| NormalizeError::UnknownLabel {
                row,
                column: column.to_string(),
                label: cell(idx).to_string(),
            })
        };

        out.push(NormalizedInput {
            profile: StudentProfile {
                name: required_name(row, &cols.name, cell(name))?,
                gender: parse_gender(row, &cols.gender, cell(gender))?,
                age: parse_whole(row, &cols.age, cell(age))?,
                grade: grade_from_token(cell(grade)),
                bullying_type: kind.map(cell).and_then(normalize_bullying_type),
            },
            scores: CompositeScores::new(
                labeled(bullying, &cols.bullying)?,
                labeled(support, &cols.social_support)?,
                labeled(mental, &cols.mental_health)?,
            ),
            actual_performance: None,
        });
    }
    Ok(out)
}

pub fn parse_survey_likert(
    bytes: &[u8],
    layout: &SurveyLayout,
    scale: ScoreScale,
) -> Result<Vec<NormalizedInput>, NormalizeError> {
    let ranges = &layout.likert;
    let mut rdr = reader(bytes);
    let index = HeaderIndex::new(rdr.headers()?);
    let missing: Vec<String> = ranges
        .required()
        .into_iter()
        .filter(|(_, position)| *position >= index.len())
        .map(|(label, position)| format!("column {} ({label})", position + 1))
        .collect();
    if !missing.is_empty() {
        return Err(NormalizeError::MissingColumns {
            missing,
            suggestions: Vec::new(),
        });
    }

    let mut out = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        if is_blank(&record) {
            continue;
        }
        let row = i + 2;
        let cell = |idx: usize| record.get(idx).unwrap_or("");
        let average = |range: ColumnRange, label: &str| -> Result<f64, NormalizeError> {
            let mut total = 0.0;
            for idx in range.start..range.end {
                let column = format!("{label} item {}", idx - range.start + 1);
                let value = parse_score(row, &column, cell(idx))?;
                total += check_scale(row, &column, value, scale)?;
            }
            Ok(total / range.len() as f64)
        };

        out.push(NormalizedInput {
            profile: StudentProfile {
                name: required_name(row, "name", cell(ranges.name))?,
                gender: parse_gender(row, "gender", cell(ranges.gender))?,
                age: parse_whole(row, "age", cell(ranges.age))?,
                grade: grade_from_token(cell(ranges.grade)),
                bullying_type: ranges.bullying_type.map(cell).and_then(normalize_bullying_type),
            },
            scores: CompositeScores::new(
                average(ranges.bullying, "bullying")?,
                average(ranges.social_support, "social support")?,
                average(ranges.mental_health, "mental health")?,
            ),
            actual_performance: None,
        });
    }
    Ok(out)
}

fn required_name(row: usize, column: &str, raw: &str) -> Result<String, NormalizeError> {
    if raw.is_empty() {
        return Err(NormalizeError::InvalidValue {
            row,
            column: column.to_string(),
            value: String::new(),
            reason: "name must not be empty".into(),
        });
    }
    Ok(raw.to_string())
}
