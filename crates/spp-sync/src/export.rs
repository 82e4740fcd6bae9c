use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use spp_core::{SchemaVersion, StudentRecord};
use spp_storage::{ExportStore, SnapshotFormat, StoredSnapshot};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: SchemaVersion,
    pub created_at: DateTime<Utc>,
    pub records: usize,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub reused: bool,
}

impl From<&StoredSnapshot> for ExportManifestFile {
    fn from(stored: &StoredSnapshot) -> Self {
        Self {
            name: stored.format.manifest_name().to_string(),
            path: stored.relative_path.display().to_string(),
            sha256: stored.sha256.clone(),
            bytes: stored.byte_size as u64,
            reused: stored.reused,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryExport {
    pub csv: StoredSnapshot,
    pub parquet: StoredSnapshot,
    pub manifest_path: PathBuf,
    pub manifest: ExportManifest,
}

/// Header plus one row per record, laid out exactly like the store.
pub fn history_csv(records: &[StudentRecord], version: SchemaVersion) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(version.header())
        .context("writing export header")?;
    for record in records {
        writer
            .write_record(record.to_row(version))
            .with_context(|| format!("writing export row for {}", record.name()))?;
    }
    writer.into_inner().context("flushing csv export")
}

pub fn history_parquet(records: &[StudentRecord]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("sequence_no", DataType::UInt32, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("gender", DataType::Utf8, false),
        ArrowField::new("age", DataType::UInt32, false),
        ArrowField::new("grade", DataType::UInt32, false),
        ArrowField::new("bullying", DataType::Float64, false),
        ArrowField::new("social_support", DataType::Float64, false),
        ArrowField::new("mental_health", DataType::Float64, false),
        ArrowField::new("physical_bullying", DataType::Float64, true),
        ArrowField::new("verbal_bullying", DataType::Float64, true),
        ArrowField::new("social_bullying", DataType::Float64, true),
        ArrowField::new("cyber_bullying", DataType::Float64, true),
        ArrowField::new("bullying_type", DataType::Utf8, true),
        ArrowField::new("predicted_score", DataType::Float64, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("actual_performance", DataType::Float64, true),
    ]));

    let sub = |pick: fn(&spp_core::BullyingSubscores) -> f64| {
        Float64Array::from(
            records
                .iter()
                .map(|r| r.scores.subscores.as_ref().map(pick))
                .collect::<Vec<_>>(),
        )
    };

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt32Array::from(records.iter().map(|r| r.sequence_no).collect::<Vec<_>>())),
            Arc::new(StringArray::from(records.iter().map(|r| Some(r.name())).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                records.iter().map(|r| Some(r.profile.gender.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(records.iter().map(|r| r.profile.age).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(records.iter().map(|r| r.profile.grade).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(records.iter().map(|r| r.scores.bullying).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.scores.social_support).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.scores.mental_health).collect::<Vec<_>>(),
            )),
            Arc::new(sub(|s| s.physical)),
            Arc::new(sub(|s| s.verbal)),
            Arc::new(sub(|s| s.social)),
            Arc::new(sub(|s| s.cyber)),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| r.profile.bullying_type.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(records.iter().map(|r| r.predicted_score).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                records.iter().map(|r| Some(r.category.label())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.actual_performance).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building history record batch")?;

    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing history record batch")?;
    writer.into_inner().context("closing parquet writer")
}

/// Writes the CSV and Parquet snapshots under one timestamped directory and a
/// manifest next to them listing their digests.
pub async fn export_history(
    exports: &ExportStore,
    records: &[StudentRecord],
    version: SchemaVersion,
    created_at: DateTime<Utc>,
) -> Result<HistoryExport> {
    let csv = exports
        .write_snapshot(created_at, SnapshotFormat::Csv, &history_csv(records, version)?)
        .await?;
    let parquet = exports
        .write_snapshot(created_at, SnapshotFormat::Parquet, &history_parquet(records)?)
        .await?;

    let manifest = ExportManifest {
        schema_version: version,
        created_at,
        records: records.len(),
        files: vec![ExportManifestFile::from(&csv), ExportManifestFile::from(&parquet)],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    let manifest_path = exports.write_manifest(created_at, &bytes).await?;

    info!(
        records = records.len(),
        manifest = %manifest_path.display(),
        "exported history"
    );
    Ok(HistoryExport {
        csv,
        parquet,
        manifest_path,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spp_core::{CategoryScheme, CompositeScores, Gender, StudentProfile};
    use tempfile::tempdir;

    fn records() -> Vec<StudentRecord> {
        ["Ayu", "Budi"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut r = StudentRecord::scored(
                    StudentProfile {
                        name: name.to_string(),
                        gender: Gender::Female,
                        age: 13,
                        grade: 7,
                        bullying_type: Some("Verbal".into()),
                    },
                    CompositeScores::new(3.0, 3.0, 3.0),
                    3.8,
                    CategoryScheme::ThreeTier,
                );
                r.sequence_no = i as u32 + 1;
                r
            })
            .collect()
    }

    #[test]
    fn csv_export_matches_store_layout() {
        let bytes = history_csv(&records(), SchemaVersion::V1).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(SchemaVersion::V1.header().join(",").as_str()));
        assert_eq!(lines.next(), Some("1,Ayu,Female,13,7,3,3,3,Verbal,3.8,High,"));
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn parquet_export_is_a_parquet_file() {
        let bytes = history_parquet(&records()).unwrap();
        assert_eq!(&bytes[..4], b"PAR1");
        assert_eq!(&bytes[bytes.len() - 4..], b"PAR1");
    }

    #[tokio::test]
    async fn export_writes_files_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let exports = ExportStore::new(dir.path());
        let created_at = DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let export = export_history(&exports, &records(), SchemaVersion::V1, created_at)
            .await
            .unwrap();
        assert!(export.csv.absolute_path.exists());
        assert!(export.parquet.absolute_path.exists());
        assert_eq!(export.manifest_path, dir.path().join("20260301_080000/manifest.json"));

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&export.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["records"], 2);
        assert_eq!(manifest["schema_version"], "v1");
        assert_eq!(manifest["files"][0]["name"], "history_csv");
        assert_eq!(manifest["files"][0]["sha256"], export.csv.sha256.as_str());

        let again = export_history(&exports, &records(), SchemaVersion::V1, created_at)
            .await
            .unwrap();
        assert!(again.csv.reused);
        assert!(again.parquet.reused);
    }
}
