//! Versioned column layouts for the tabular store.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FeatureLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    No,
    Name,
    Gender,
    Age,
    Grade,
    BullyingLevel,
    SocialSupport,
    MentalHealth,
    PhysicalBullying,
    VerbalBullying,
    SocialBullying,
    CyberBullying,
    BullyingType,
    PredictedPerformance,
    Category,
    ActualPerformance,
}

impl Column {
    pub fn label(self) -> &'static str {
        match self {
            Self::No => "No",
            Self::Name => "Name",
            Self::Gender => "Gender",
            Self::Age => "Age",
            Self::Grade => "Grade",
            Self::BullyingLevel => "Bullying Level",
            Self::SocialSupport => "Social Support",
            Self::MentalHealth => "Mental Health",
            Self::PhysicalBullying => "Physical Bullying",
            Self::VerbalBullying => "Verbal Bullying",
            Self::SocialBullying => "Social Bullying",
            Self::CyberBullying => "Cyber Bullying",
            Self::BullyingType => "Bullying Type",
            Self::PredictedPerformance => "Predicted Performance",
            Self::Category => "Category",
            Self::ActualPerformance => "Actual Performance",
        }
    }
}

const V1_COLUMNS: &[Column] = &[
    Column::No,
    Column::Name,
    Column::Gender,
    Column::Age,
    Column::Grade,
    Column::BullyingLevel,
    Column::SocialSupport,
    Column::MentalHealth,
    Column::BullyingType,
    Column::PredictedPerformance,
    Column::Category,
    Column::ActualPerformance,
];

const V2_COLUMNS: &[Column] = &[
    Column::No,
    Column::Name,
    Column::Gender,
    Column::Age,
    Column::Grade,
    Column::BullyingLevel,
    Column::SocialSupport,
    Column::MentalHealth,
    Column::PhysicalBullying,
    Column::VerbalBullying,
    Column::SocialBullying,
    Column::CyberBullying,
    Column::BullyingType,
    Column::PredictedPerformance,
    Column::Category,
    Column::ActualPerformance,
];

/// Declared header versions. The header row is the wire contract with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    #[default]
    V1,
    V2,
}

impl SchemaVersion {
    pub const ALL: [SchemaVersion; 2] = [SchemaVersion::V1, SchemaVersion::V2];

    pub fn columns(self) -> &'static [Column] {
        match self {
            Self::V1 => V1_COLUMNS,
            Self::V2 => V2_COLUMNS,
        }
    }

    pub fn header(self) -> Vec<String> {
        self.columns().iter().map(|c| c.label().to_string()).collect()
    }

    pub fn index_of(self, column: Column) -> Option<usize> {
        self.columns().iter().position(|c| *c == column)
    }

    pub fn width(self) -> usize {
        self.columns().len()
    }

    /// Feature layout a model must have to feed records of this version.
    pub fn feature_layout(self) -> FeatureLayout {
        match self {
            Self::V1 => FeatureLayout::Composite,
            Self::V2 => FeatureLayout::Extended,
        }
    }

    /// Exact, order-sensitive header comparison.
    pub fn matches(self, header: &[String]) -> bool {
        let columns = self.columns();
        header.len() == columns.len()
            && header
                .iter()
                .zip(columns)
                .all(|(cell, column)| cell == column.label())
    }

    pub fn detect(header: &[String]) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.matches(header))
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            other => Err(format!("unknown schema version `{other}`")),
        }
    }
}
