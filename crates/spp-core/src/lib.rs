//! Core domain model for student performance prediction records.

use std::fmt;

use serde::{Deserialize, Serialize};

mod classify;
mod error;
mod schema;

pub use classify::{Category, CategoryScheme};
pub use error::{SppError, SppResult, UserAction};
pub use schema::{Column, SchemaVersion};

pub const CRATE_NAME: &str = "spp-core";

/// One store row, cell by cell.
pub type Row = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "Male",
            Self::Female => "Female",
        }
    }

    /// Accepts single-letter and full-word forms, case and whitespace insensitive.
    pub fn from_alias(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "m" | "male" | "l" | "laki-laki" | "laki laki" => Some(Self::Male),
            "f" | "female" | "p" | "perempuan" => Some(Self::Female),
            _ => None,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type bullying exposure scores used by the extended model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BullyingSubscores {
    pub physical: f64,
    pub verbal: f64,
    pub social: f64,
    pub cyber: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeScores {
    pub bullying: f64,
    pub social_support: f64,
    pub mental_health: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscores: Option<BullyingSubscores>,
}

impl CompositeScores {
    pub fn new(bullying: f64, social_support: f64, mental_health: f64) -> Self {
        Self {
            bullying,
            social_support,
            mental_health,
            subscores: None,
        }
    }

    pub fn with_subscores(mut self, subscores: BullyingSubscores) -> Self {
        self.subscores = Some(subscores);
        self
    }

    pub fn to_features(&self, layout: FeatureLayout) -> SppResult<FeatureVector> {
        let mut values = vec![self.bullying, self.social_support, self.mental_health];
        if layout == FeatureLayout::Extended {
            let Some(sub) = self.subscores else {
                return Err(SppError::ModelInputShape {
                    expected: layout.arity(),
                    actual: values.len(),
                });
            };
            values.extend([sub.physical, sub.verbal, sub.social, sub.cyber]);
        }
        Ok(FeatureVector { layout, values })
    }
}

/// Feature order a model was trained on. The two layouts are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureLayout {
    Composite,
    Extended,
}

impl FeatureLayout {
    pub fn feature_names(self) -> &'static [&'static str] {
        match self {
            Self::Composite => &["bullying", "social_support", "mental_health"],
            Self::Extended => &[
                "bullying",
                "social_support",
                "mental_health",
                "physical_bullying",
                "verbal_bullying",
                "social_bullying",
                "cyber_bullying",
            ],
        }
    }

    pub fn arity(self) -> usize {
        self.feature_names().len()
    }

    pub fn from_feature_names(names: &[String]) -> Option<Self> {
        [Self::Composite, Self::Extended].into_iter().find(|layout| {
            let expected = layout.feature_names();
            expected.len() == names.len()
                && expected.iter().zip(names).all(|(a, b)| *a == b.as_str())
        })
    }
}

/// Canonical, fixed-order model input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    layout: FeatureLayout,
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn layout(&self) -> FeatureLayout {
        self.layout
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Descriptive fields carried next to the features, untouched by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub name: String,
    pub gender: Gender,
    pub age: u32,
    pub grade: u32,
    #[serde(default)]
    pub bullying_type: Option<String>,
}

/// One row of the store. `sequence_no` is 0 until the synchronizer assigns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub sequence_no: u32,
    #[serde(flatten)]
    pub profile: StudentProfile,
    pub scores: CompositeScores,
    pub predicted_score: f64,
    pub category: Category,
    #[serde(default)]
    pub actual_performance: Option<f64>,
}

/// Observed performance accepted from any write path: finite and not negative.
pub fn is_valid_performance(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

impl StudentRecord {
    pub fn scored(
        profile: StudentProfile,
        scores: CompositeScores,
        predicted_score: f64,
        scheme: CategoryScheme,
    ) -> Self {
        Self {
            sequence_no: 0,
            profile,
            scores,
            predicted_score,
            category: scheme.classify(predicted_score),
            actual_performance: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Identity key used for deduplication.
    pub fn identity_key(&self) -> &str {
        self.profile.name.trim()
    }

    pub fn reclassify(&mut self, scheme: CategoryScheme) {
        self.category = scheme.classify(self.predicted_score);
    }

    pub fn to_row(&self, version: SchemaVersion) -> Row {
        let sub = self.scores.subscores;
        version
            .columns()
            .iter()
            .map(|column| match column {
                Column::No => self.sequence_no.to_string(),
                Column::Name => self.profile.name.clone(),
                Column::Gender => self.profile.gender.to_string(),
                Column::Age => self.profile.age.to_string(),
                Column::Grade => self.profile.grade.to_string(),
                Column::BullyingLevel => self.scores.bullying.to_string(),
                Column::SocialSupport => self.scores.social_support.to_string(),
                Column::MentalHealth => self.scores.mental_health.to_string(),
                Column::PhysicalBullying => sub.map(|s| s.physical.to_string()).unwrap_or_default(),
                Column::VerbalBullying => sub.map(|s| s.verbal.to_string()).unwrap_or_default(),
                Column::SocialBullying => sub.map(|s| s.social.to_string()).unwrap_or_default(),
                Column::CyberBullying => sub.map(|s| s.cyber.to_string()).unwrap_or_default(),
                Column::BullyingType => self.profile.bullying_type.clone().unwrap_or_default(),
                Column::PredictedPerformance => self.predicted_score.to_string(),
                Column::Category => self.category.to_string(),
                Column::ActualPerformance => self
                    .actual_performance
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Decodes a stored row. The category cell is ignored and re-derived from
    /// the predicted score so it can never drift from it.
    pub fn from_row(row: &[String], version: SchemaVersion, scheme: CategoryScheme) -> SppResult<Self> {
        let cell = |column: Column| cell_text(row, version, column);

        let name = cell(Column::Name);
        if name.is_empty() {
            return Err(SppError::InvalidInput("stored row has an empty name".into()));
        }
        let gender = Gender::from_alias(cell(Column::Gender)).ok_or_else(|| {
            SppError::InvalidInput(format!("unknown gender `{}` for {name}", cell(Column::Gender)))
        })?;

        let subscores = if version.index_of(Column::PhysicalBullying).is_some()
            && !cell(Column::PhysicalBullying).is_empty()
        {
            Some(BullyingSubscores {
                physical: parse_number(Column::PhysicalBullying, cell(Column::PhysicalBullying))?,
                verbal: parse_number(Column::VerbalBullying, cell(Column::VerbalBullying))?,
                social: parse_number(Column::SocialBullying, cell(Column::SocialBullying))?,
                cyber: parse_number(Column::CyberBullying, cell(Column::CyberBullying))?,
            })
        } else {
            None
        };

        let predicted_score =
            parse_number(Column::PredictedPerformance, cell(Column::PredictedPerformance))?;
        let actual = cell(Column::ActualPerformance);

        Ok(Self {
            sequence_no: parse_whole(Column::No, cell(Column::No))?,
            profile: StudentProfile {
                name: name.to_string(),
                gender,
                age: parse_whole(Column::Age, cell(Column::Age))?,
                grade: parse_whole(Column::Grade, cell(Column::Grade))?,
                bullying_type: Some(cell(Column::BullyingType).to_string()).filter(|s| !s.is_empty()),
            },
            scores: CompositeScores {
                bullying: parse_number(Column::BullyingLevel, cell(Column::BullyingLevel))?,
                social_support: parse_number(Column::SocialSupport, cell(Column::SocialSupport))?,
                mental_health: parse_number(Column::MentalHealth, cell(Column::MentalHealth))?,
                subscores,
            },
            predicted_score,
            category: scheme.classify(predicted_score),
            actual_performance: if actual.is_empty() {
                None
            } else {
                Some(parse_number(Column::ActualPerformance, actual)?)
            },
        })
    }
}

fn cell_text(row: &[String], version: SchemaVersion, column: Column) -> &str {
    version
        .index_of(column)
        .and_then(|i| row.get(i))
        .map(|s| s.trim())
        .unwrap_or("")
}

fn parse_number(column: Column, text: &str) -> SppResult<f64> {
    text.parse::<f64>().map_err(|_| {
        SppError::InvalidInput(format!("column `{}` holds non-numeric `{text}`", column.label()))
    })
}

/// Integer cells may come back from a spreadsheet as `12.0`.
fn parse_whole(column: Column, text: &str) -> SppResult<u32> {
    if let Ok(v) = text.parse::<u32>() {
        return Ok(v);
    }
    match text.parse::<f64>() {
        Ok(v) if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => Ok(v as u32),
        _ => Err(SppError::InvalidInput(format!(
            "column `{}` holds non-integer `{text}`",
            column.label()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StudentRecord {
        let mut record = StudentRecord::scored(
            StudentProfile {
                name: "Ayu".into(),
                gender: Gender::Female,
                age: 14,
                grade: 8,
                bullying_type: Some("Verbal".into()),
            },
            CompositeScores::new(3.0, 4.0, 2.5),
            3.125,
            CategoryScheme::ThreeTier,
        );
        record.sequence_no = 4;
        record
    }

    #[test]
    fn gender_aliases_normalize() {
        assert_eq!(Gender::from_alias(" M "), Some(Gender::Male));
        assert_eq!(Gender::from_alias("Laki-laki"), Some(Gender::Male));
        assert_eq!(Gender::from_alias("FEMALE"), Some(Gender::Female));
        assert_eq!(Gender::from_alias("p"), Some(Gender::Female));
        assert_eq!(Gender::from_alias("x"), None);
    }

    #[test]
    fn record_row_layout_follows_header() {
        let row = sample().to_row(SchemaVersion::V1);
        assert_eq!(row.len(), SchemaVersion::V1.width());
        assert_eq!(row[0], "4");
        assert_eq!(row[1], "Ayu");
        assert_eq!(row[5], "3");
        assert_eq!(row[9], "3.125");
        assert_eq!(row[10], "Moderate");
        assert_eq!(row[11], "");
    }

    #[test]
    fn decoding_rederives_category_from_score() {
        let mut row = sample().to_row(SchemaVersion::V1);
        row[10] = "High".into();
        row[3] = "14.0".into();
        let decoded = StudentRecord::from_row(&row, SchemaVersion::V1, CategoryScheme::ThreeTier).unwrap();
        assert_eq!(decoded.category, Category::Moderate);
        assert_eq!(decoded.profile.age, 14);
        assert_eq!(decoded.actual_performance, None);

        let four = StudentRecord::from_row(&row, SchemaVersion::V1, CategoryScheme::FourTier).unwrap();
        assert_eq!(four.category, Category::Fair);
    }

    #[test]
    fn decoding_rejects_non_numeric_scores() {
        let mut row = sample().to_row(SchemaVersion::V1);
        row[9] = "n/a".into();
        let err = StudentRecord::from_row(&row, SchemaVersion::V1, CategoryScheme::ThreeTier).unwrap_err();
        assert!(matches!(err, SppError::InvalidInput(_)));
    }

    #[test]
    fn extended_features_require_subscores() {
        let scores = CompositeScores::new(3.0, 3.0, 3.0);
        assert_eq!(scores.to_features(FeatureLayout::Composite).unwrap().len(), 3);
        let err = scores.to_features(FeatureLayout::Extended).unwrap_err();
        assert!(matches!(err, SppError::ModelInputShape { expected: 7, actual: 3 }));

        let extended = scores.with_subscores(BullyingSubscores {
            physical: 1.0,
            verbal: 2.0,
            social: 3.0,
            cyber: 4.0,
        });
        let features = extended.to_features(FeatureLayout::Extended).unwrap();
        assert_eq!(features.values(), &[3.0, 3.0, 3.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn v2_rows_carry_subscores() {
        let mut record = sample();
        record.scores.subscores = Some(BullyingSubscores {
            physical: 1.0,
            verbal: 4.5,
            social: 2.0,
            cyber: 1.0,
        });
        let row = record.to_row(SchemaVersion::V2);
        assert_eq!(row[9], "4.5");
        let decoded = StudentRecord::from_row(&row, SchemaVersion::V2, CategoryScheme::ThreeTier).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn layout_detected_from_feature_names() {
        let names = vec!["bullying".to_string(), "social_support".into(), "mental_health".into()];
        assert_eq!(FeatureLayout::from_feature_names(&names), Some(FeatureLayout::Composite));
        assert_eq!(FeatureLayout::from_feature_names(&names[..2]), None);
    }
}
