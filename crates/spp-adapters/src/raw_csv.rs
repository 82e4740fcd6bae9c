use csv::{ReaderBuilder, StringRecord, Trim};
use spp_core::{is_valid_performance, BullyingSubscores, CompositeScores, StudentProfile};

use crate::{
    check_scale, closest_header, grade_from_token, normalize_bullying_type, parse_gender,
    parse_score, parse_whole, NormalizeError, NormalizedInput, ScoreScale,
};

pub const REQUIRED_COLUMNS: [&str; 8] = [
    "Name",
    "Gender",
    "Age",
    "Grade",
    "Bullying Level",
    "Social Support",
    "Mental Health",
    "Bullying Type",
];

const ACTUAL_COLUMN: &str = "Actual Performance";
const SUBSCORE_COLUMNS: [&str; 4] = [
    "Physical Bullying",
    "Verbal Bullying",
    "Social Bullying",
    "Cyber Bullying",
];

/// Header name to column index, resolved once per upload.
pub(crate) struct HeaderIndex {
    headers: Vec<String>,
}

impl HeaderIndex {
    pub(crate) fn new(record: &StringRecord) -> Self {
        let headers = record
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                h.trim().to_string()
            })
            .collect();
        Self { headers }
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// All-or-nothing lookup; reports every missing column at once.
    pub(crate) fn require<const N: usize>(&self, names: [&str; N]) -> Result<[usize; N], NormalizeError> {
        let mut found = [0usize; N];
        let mut missing = Vec::new();
        let mut suggestions = Vec::new();
        for (slot, name) in found.iter_mut().zip(names) {
            match self.position(name) {
                Some(i) => *slot = i,
                None => {
                    missing.push(name.to_string());
                    if let Some(close) = closest_header(name, &self.headers) {
                        suggestions.push((name.to_string(), close));
                    }
                }
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(NormalizeError::MissingColumns { missing, suggestions })
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.headers.len()
    }
}

pub(crate) fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(bytes)
}

pub(crate) fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|cell| cell.trim().is_empty())
}

/// Parses a delimited upload whose header carries the store's own column names.
/// Row numbers in errors count the header as row 1.
pub fn parse_raw_csv(bytes: &[u8], scale: ScoreScale) -> Result<Vec<NormalizedInput>, NormalizeError> {
    let mut rdr = reader(bytes);
    let index = HeaderIndex::new(rdr.headers()?);
    let [name, gender, age, grade, bullying, support, mental, kind] = index.require(REQUIRED_COLUMNS)?;
    let actual = index.position(ACTUAL_COLUMN);
    let subscores = index.require(SUBSCORE_COLUMNS).ok();

    let mut out = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        if is_blank(&record) {
            continue;
        }
        let row = i + 2;
        let cell = |idx: usize| record.get(idx).unwrap_or("");

        let student_name = cell(name);
        if student_name.is_empty() {
            return Err(NormalizeError::InvalidValue {
                row,
                column: "Name".into(),
                value: String::new(),
                reason: "name must not be empty".into(),
            });
        }

        let grade_value = grade_from_token(cell(grade));
        if grade_value == 0 {
            return Err(NormalizeError::InvalidValue {
                row,
                column: "Grade".into(),
                value: cell(grade).to_string(),
                reason: "expected a grade 1 to 12 or a Roman numeral".into(),
            });
        }

        let score = |idx: usize, column: &str| {
            parse_score(row, column, cell(idx)).and_then(|v| check_scale(row, column, v, scale))
        };
        let mut scores = CompositeScores::new(
            score(bullying, "Bullying Level")?,
            score(support, "Social Support")?,
            score(mental, "Mental Health")?,
        );
        if let Some([physical, verbal, social, cyber]) = subscores {
            if !cell(physical).is_empty() {
                scores = scores.with_subscores(BullyingSubscores {
                    physical: score(physical, SUBSCORE_COLUMNS[0])?,
                    verbal: score(verbal, SUBSCORE_COLUMNS[1])?,
                    social: score(social, SUBSCORE_COLUMNS[2])?,
                    cyber: score(cyber, SUBSCORE_COLUMNS[3])?,
                });
            }
        }

        let actual_performance = match actual.map(cell).filter(|v| !v.is_empty()) {
            Some(text) => match parse_score(row, ACTUAL_COLUMN, text)? {
                v if is_valid_performance(v) => Some(v),
                _ => {
                    return Err(NormalizeError::InvalidValue {
                        row,
                        column: ACTUAL_COLUMN.into(),
                        value: text.to_string(),
                        reason: "expected a non-negative number".into(),
                    })
                }
            },
            None => None,
        };

        out.push(NormalizedInput {
            profile: StudentProfile {
                name: student_name.to_string(),
                gender: parse_gender(row, "Gender", cell(gender))?,
                age: parse_whole(row, "Age", cell(age))?,
                grade: grade_value,
                bullying_type: normalize_bullying_type(cell(kind)),
            },
            scores,
            actual_performance,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spp_core::Gender;

    const HEADER: &str =
        "Name,Gender,Age,Grade,Bullying Level,Social Support,Mental Health,Bullying Type";

    #[test]
    fn rows_are_normalized() {
        let body = format!("{HEADER}\n Budi , m ,14,VIII,2,4,3.5, verbal \nSari,Perempuan,13,7,1,5,4,\n");
        let rows = parse_raw_csv(body.as_bytes(), ScoreScale::FIVE_POINT).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].profile.name, "Budi");
        assert_eq!(rows[0].profile.gender, Gender::Male);
        assert_eq!(rows[0].profile.grade, 8);
        assert_eq!(rows[0].profile.bullying_type.as_deref(), Some("Verbal"));
        assert_eq!(rows[0].scores.mental_health, 3.5);
        assert_eq!(rows[1].profile.gender, Gender::Female);
        assert_eq!(rows[1].profile.bullying_type, None);
        assert_eq!(rows[1].actual_performance, None);
    }

    #[test]
    fn missing_columns_are_listed_with_suggestions() {
        let body = "Name,Gender,Age,Grade,Bullying Levl,Social Support,Mental Health\nA,M,14,7,1,1,1\n";
        let err = parse_raw_csv(body.as_bytes(), ScoreScale::FIVE_POINT).unwrap_err();
        match err {
            NormalizeError::MissingColumns { missing, suggestions } => {
                assert_eq!(missing, vec!["Bullying Level".to_string(), "Bullying Type".to_string()]);
                assert!(suggestions
                    .iter()
                    .any(|(want, found)| want == "Bullying Level" && found == "Bullying Levl"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn optional_actual_and_subscores_are_read() {
        let body = format!(
            "{HEADER},Physical Bullying,Verbal Bullying,Social Bullying,Cyber Bullying,Actual Performance\n\
             Ayu,F,14,9,3,3,3,Cyber,1,2,3,4,3.7\n"
        );
        let rows = parse_raw_csv(body.as_bytes(), ScoreScale::FIVE_POINT).unwrap();
        assert_eq!(rows[0].actual_performance, Some(3.7));
        let sub = rows[0].scores.subscores.unwrap();
        assert_eq!((sub.physical, sub.cyber), (1.0, 4.0));
    }

    #[test]
    fn unusable_actual_performance_is_rejected() {
        let header = format!("{HEADER},Actual Performance");
        for (bad, row) in [("NaN", 2), ("inf", 2), ("-9", 3)] {
            let body = if row == 2 {
                format!("{header}\nAna,F,14,9,3,3,3,,{bad}\n")
            } else {
                format!("{header}\nAna,F,14,9,3,3,3,,4.2\nBo,M,15,9,3,3,3,,{bad}\n")
            };
            let err = parse_raw_csv(body.as_bytes(), ScoreScale::FIVE_POINT).unwrap_err();
            assert!(
                matches!(err, NormalizeError::InvalidValue { row: r, ref column, .. } if r == row && column == ACTUAL_COLUMN),
                "{bad}: {err:?}"
            );
        }
    }

    #[test]
    fn bad_cells_name_their_row_and_column() {
        let body = format!("{HEADER}\nAyu,F,14,9,3,3,3,\nBudi,X,14,9,3,3,3,\n");
        let err = parse_raw_csv(body.as_bytes(), ScoreScale::FIVE_POINT).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::InvalidValue { row: 3, ref column, .. } if column == "Gender"
        ));

        let out_of_scale = format!("{HEADER}\nAyu,F,14,9,7,3,3,\n");
        assert!(parse_raw_csv(out_of_scale.as_bytes(), ScoreScale::FIVE_POINT).is_err());
        assert!(parse_raw_csv(out_of_scale.as_bytes(), ScoreScale::TEN_POINT).is_ok());
    }

    #[test]
    fn blank_lines_are_ignored() {
        let body = format!("{HEADER}\n,,,,,,,\nAyu,F,14,9,3,3,3,\n");
        assert_eq!(parse_raw_csv(body.as_bytes(), ScoreScale::FIVE_POINT).unwrap().len(), 1);
    }
}
