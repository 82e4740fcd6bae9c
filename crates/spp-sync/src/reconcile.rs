//! Idempotent, deduplicating append of candidate records onto the store.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spp_core::{Column, Row, SchemaVersion, SppError, SppResult, StudentRecord};
use spp_storage::TabularStore;
use tracing::{info, info_span, warn, Instrument};

use crate::schema::write_rows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NumberingPolicy {
    /// Lowest positive number not used by any stored or already-added row.
    #[default]
    SmallestUnused,
    /// Data-row count at write time plus one. Can reuse numbers after deletions.
    RowCount,
}

impl FromStr for NumberingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smallest-unused" => Ok(Self::SmallestUnused),
            "row-count" => Ok(Self::RowCount),
            other => Err(format!("unknown numbering policy `{other}`")),
        }
    }
}

/// One point-in-time read of the store, header included.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    total_rows: usize,
    keys: HashSet<String>,
    numbers: BTreeSet<u32>,
}

impl StoreSnapshot {
    pub fn from_rows(rows: &[Row], version: SchemaVersion) -> Self {
        let name_at = version.index_of(Column::Name);
        let no_at = version.index_of(Column::No);
        let data = rows.iter().skip(1);

        let keys = data
            .clone()
            .filter_map(|row| name_at.and_then(|i| row.get(i)))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        let numbers = data
            .filter_map(|row| no_at.and_then(|i| row.get(i)))
            .filter_map(|cell| parse_sequence(cell))
            .collect();

        Self {
            total_rows: rows.len(),
            keys,
            numbers,
        }
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn data_rows(&self) -> usize {
        self.total_rows.saturating_sub(1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key.trim())
    }
}

/// Sequence cells may read back as `3.0` from a spreadsheet.
fn parse_sequence(cell: &str) -> Option<u32> {
    let cell = cell.trim();
    cell.parse::<u32>().ok().or_else(|| {
        cell.parse::<f64>()
            .ok()
            .filter(|v| *v >= 1.0 && v.fract() == 0.0 && *v <= u32::MAX as f64)
            .map(|v| v as u32)
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    pub added: Vec<StudentRecord>,
    pub skipped: Vec<StudentRecord>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
    }
}

/// Partitions `candidates` in input order. The first occurrence of a name
/// wins; later ones, and names already in the snapshot, are skipped.
pub fn plan_reconciliation(
    candidates: Vec<StudentRecord>,
    snapshot: &StoreSnapshot,
    numbering: NumberingPolicy,
) -> Reconciliation {
    let mut seen: HashSet<String> = HashSet::new();
    let mut used = snapshot.numbers.clone();
    let mut cursor = 1u32;
    let mut plan = Reconciliation::default();

    for mut record in candidates {
        let key = record.identity_key().to_string();
        if snapshot.contains_key(&key) || !seen.insert(key) {
            plan.skipped.push(record);
            continue;
        }
        record.sequence_no = match numbering {
            NumberingPolicy::SmallestUnused => {
                while used.contains(&cursor) {
                    cursor += 1;
                }
                used.insert(cursor);
                cursor
            }
            NumberingPolicy::RowCount => (snapshot.data_rows() + plan.added.len() + 1) as u32,
        };
        plan.added.push(record);
    }
    plan
}

/// Store-facing side of reconciliation.
#[derive(Clone)]
pub struct Synchronizer {
    store: Arc<dyn TabularStore>,
    version: SchemaVersion,
    numbering: NumberingPolicy,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn TabularStore>, version: SchemaVersion, numbering: NumberingPolicy) -> Self {
        Self {
            store,
            version,
            numbering,
        }
    }

    pub async fn snapshot(&self) -> SppResult<StoreSnapshot> {
        let rows = self.store.read_all().await.map_err(|e| e.into_spp("read_all"))?;
        Ok(StoreSnapshot::from_rows(&rows, self.version))
    }

    /// Reads once, plans, then appends the added rows in one batch. If the
    /// row count moved since the snapshot nothing is written. Re-running with
    /// the same batch after any failure is safe: stored names are skipped.
    pub async fn reconcile(&self, candidates: Vec<StudentRecord>) -> SppResult<Reconciliation> {
        let span = info_span!("reconcile", backend = self.store.backend(), candidates = candidates.len());
        async move {
            let snapshot = self.snapshot().await?;
            let plan = plan_reconciliation(candidates, &snapshot, self.numbering);
            if plan.is_noop() {
                info!(skipped = plan.skipped.len(), "nothing new to append");
                return Ok(plan);
            }

            let actual_rows = self
                .store
                .row_count()
                .await
                .map_err(|e| e.into_spp("row_count"))?;
            if actual_rows != snapshot.total_rows() {
                warn!(expected = snapshot.total_rows(), actual = actual_rows, "store changed under reconciliation");
                return Err(SppError::ConcurrentModification {
                    expected_rows: snapshot.total_rows(),
                    actual_rows,
                });
            }

            let rows: Vec<Row> = plan.added.iter().map(|r| r.to_row(self.version)).collect();
            write_rows(self.store.as_ref(), rows).await?;
            info!(added = plan.added.len(), skipped = plan.skipped.len(), "reconciled batch");
            Ok(plan)
        }
        .instrument(span)
        .await
    }
}
