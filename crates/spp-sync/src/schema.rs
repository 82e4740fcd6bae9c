use std::str::FromStr;

use serde::{Deserialize, Serialize};
use spp_core::{Row, SchemaVersion, SppError, SppResult};
use spp_storage::TabularStore;
use tracing::{info, warn};

/// What to do when the stored header is neither the target nor a known version,
/// or when moving between known versions would drop stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftPolicy {
    #[default]
    Reset,
    Reject,
}

impl FromStr for DriftPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Self::Reset),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown schema drift policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SchemaStatus {
    Intact,
    Initialized,
    Migrated { from: SchemaVersion },
    Reset { discarded_rows: usize },
}

/// Sheets-style backends drop trailing empty cells; other backends may pad.
fn trim_trailing_blanks(mut row: Row) -> Row {
    while row.last().is_some_and(|cell| cell.trim().is_empty()) {
        row.pop();
    }
    row
}

/// Re-lays a row of `from` into the column order of `to`. Columns `from`
/// does not have come out empty.
pub fn migrate_row(row: &[String], from: SchemaVersion, to: SchemaVersion) -> Row {
    to.columns()
        .iter()
        .map(|column| {
            from.index_of(*column)
                .and_then(|i| row.get(i))
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

/// Makes the first store row equal the header of `version`. Run once per
/// session before any other store access.
pub async fn ensure_schema(
    store: &dyn TabularStore,
    version: SchemaVersion,
    policy: DriftPolicy,
) -> SppResult<SchemaStatus> {
    let header = store
        .read_header()
        .await
        .map_err(|e| e.into_spp("read_header"))?
        .map(trim_trailing_blanks);

    let Some(header) = header else {
        write_rows(store, vec![version.header()]).await?;
        info!(?version, "initialized empty store with header");
        return Ok(SchemaStatus::Initialized);
    };

    if version.matches(&header) {
        return Ok(SchemaStatus::Intact);
    }

    if let Some(from) = SchemaVersion::detect(&header) {
        let rows = store.read_all().await.map_err(|e| e.into_spp("read_all"))?;
        let dropped: Vec<usize> = from
            .columns()
            .iter()
            .filter(|column| version.index_of(**column).is_none())
            .filter_map(|column| from.index_of(*column))
            .collect();
        let lossy_rows = rows
            .iter()
            .skip(1)
            .filter(|row| dropped.iter().any(|&i| row.get(i).is_some_and(|c| !c.trim().is_empty())))
            .count();
        if lossy_rows > 0 {
            if policy == DriftPolicy::Reject {
                return Err(SppError::SchemaMismatch(format!(
                    "moving the store from {from:?} to {version:?} would drop values in {lossy_rows} row(s)"
                )));
            }
            warn!(?from, to = ?version, lossy_rows, "migration drops columns the target schema lacks");
        }
        let mut rewritten = vec![version.header()];
        rewritten.extend(rows.iter().skip(1).map(|row| migrate_row(row, from, version)));
        info!(?from, to = ?version, rows = rewritten.len() - 1, "migrating store rows to new header");
        store.clear().await.map_err(|e| e.into_spp("clear"))?;
        write_rows(store, rewritten).await?;
        return Ok(SchemaStatus::Migrated { from });
    }

    match policy {
        DriftPolicy::Reject => Err(SppError::SchemaMismatch(format!(
            "store header {header:?} matches no declared schema version"
        ))),
        DriftPolicy::Reset => {
            let discarded_rows = store
                .row_count()
                .await
                .map_err(|e| e.into_spp("row_count"))?
                .saturating_sub(1);
            warn!(
                ?header,
                ?version,
                discarded_rows,
                "store header matches no declared schema version; clearing store and rewriting header"
            );
            store.clear().await.map_err(|e| e.into_spp("clear"))?;
            write_rows(store, vec![version.header()]).await?;
            Ok(SchemaStatus::Reset { discarded_rows })
        }
    }
}

/// Appends after a clear. A failure part way is reported with the rows that landed.
pub(crate) async fn write_rows(store: &dyn TabularStore, rows: Vec<Row>) -> SppResult<()> {
    store
        .append_rows(&rows)
        .await
        .map_err(|partial| SppError::PartialBatch {
            committed: partial.committed,
            source: Box::new(partial.source.into_spp("append_rows")),
        })
}
