use spp_core::{is_valid_performance, Column, Row, SchemaVersion, SppError, SppResult};
use spp_storage::TabularStore;
use tracing::{info, warn};

use crate::schema::write_rows;

/// Clears the store and leaves only the header.
pub async fn delete_all(store: &dyn TabularStore, version: SchemaVersion) -> SppResult<usize> {
    let removed = store
        .row_count()
        .await
        .map_err(|e| e.into_spp("row_count"))?
        .saturating_sub(1);
    store.clear().await.map_err(|e| e.into_spp("clear"))?;
    write_rows(store, vec![version.header()]).await?;
    warn!(removed, "deleted all student records");
    Ok(removed)
}

fn cell<'a>(row: &'a [String], version: SchemaVersion, column: Column) -> &'a str {
    version
        .index_of(column)
        .and_then(|i| row.get(i))
        .map(|s| s.trim())
        .unwrap_or("")
}

/// Removes every row whose name equals `key` (trimmed) and rewrites the
/// survivors in their original order. An unknown key writes nothing.
pub async fn delete_by_key(store: &dyn TabularStore, version: SchemaVersion, key: &str) -> SppResult<usize> {
    let key = key.trim();
    let rows = store.read_all().await.map_err(|e| e.into_spp("read_all"))?;
    let (matching, survivors): (Vec<Row>, Vec<Row>) = rows
        .into_iter()
        .skip(1)
        .partition(|row| cell(row, version, Column::Name) == key);
    if matching.is_empty() {
        return Ok(0);
    }

    let mut rewritten = Vec::with_capacity(survivors.len() + 1);
    rewritten.push(version.header());
    rewritten.extend(survivors);
    store.clear().await.map_err(|e| e.into_spp("clear"))?;
    write_rows(store, rewritten).await?;
    info!(key, removed = matching.len(), "deleted student records");
    Ok(matching.len())
}

/// Fills the actual-performance cell of the first row for `key` that has none.
/// Returns the 1-based store row that was written, or `None` when every
/// matching row is already filled (or none exists).
pub async fn set_actual_performance(
    store: &dyn TabularStore,
    version: SchemaVersion,
    key: &str,
    value: f64,
) -> SppResult<Option<usize>> {
    if !is_valid_performance(value) {
        return Err(SppError::InvalidInput(format!(
            "actual performance `{value}` must be a non-negative number"
        )));
    }
    let column = version
        .index_of(Column::ActualPerformance)
        .ok_or_else(|| SppError::SchemaMismatch("schema has no actual performance column".into()))?;
    let key = key.trim();

    let rows = store.read_all().await.map_err(|e| e.into_spp("read_all"))?;
    let target = rows.iter().enumerate().skip(1).find(|(_, row)| {
        cell(row, version, Column::Name) == key && cell(row, version, Column::ActualPerformance).is_empty()
    });
    let Some((index, _)) = target else {
        return Ok(None);
    };

    let store_row = index + 1;
    store
        .update_cell(store_row, column + 1, value.to_string())
        .await
        .map_err(|e| e.into_spp("update_cell"))?;
    info!(key, store_row, value, "recorded actual performance");
    Ok(Some(store_row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spp_storage::MemoryStore;

    fn row(no: &str, name: &str, actual: &str) -> Row {
        vec![
            no, name, "Male", "14", "8", "3", "3", "3", "", "3.8", "High", actual,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn seeded() -> MemoryStore {
        MemoryStore::with_rows(vec![
            SchemaVersion::V1.header(),
            row("1", "Ayu", ""),
            row("2", "Budi", ""),
            row("3", "Ayu", ""),
            row("4", "Citra", "4.1"),
        ])
    }

    #[tokio::test]
    async fn delete_by_key_removes_every_match_and_keeps_order() {
        let store = seeded();
        assert_eq!(delete_by_key(&store, SchemaVersion::V1, " Ayu ").await.unwrap(), 2);
        let rows = store.rows().await;
        assert_eq!(rows[0], SchemaVersion::V1.header());
        assert_eq!(rows[1], row("2", "Budi", ""));
        assert_eq!(rows[2], row("4", "Citra", "4.1"));
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn deleting_unknown_key_is_noop() {
        let store = seeded();
        let before = store.rows().await;
        assert_eq!(delete_by_key(&store, SchemaVersion::V1, "Zed").await.unwrap(), 0);
        assert_eq!(store.rows().await, before);
    }

    #[tokio::test]
    async fn delete_all_keeps_header_only() {
        let store = seeded();
        assert_eq!(delete_all(&store, SchemaVersion::V1).await.unwrap(), 4);
        assert_eq!(store.rows().await, vec![SchemaVersion::V1.header()]);
    }

    #[tokio::test]
    async fn actual_performance_fills_first_empty_match_once() {
        let store = seeded();
        let first = set_actual_performance(&store, SchemaVersion::V1, "Ayu", 3.5).await.unwrap();
        assert_eq!(first, Some(2));
        let second = set_actual_performance(&store, SchemaVersion::V1, "Ayu", 2.0).await.unwrap();
        assert_eq!(second, Some(4));
        let third = set_actual_performance(&store, SchemaVersion::V1, "Ayu", 1.0).await.unwrap();
        assert_eq!(third, None);

        let rows = store.rows().await;
        assert_eq!(rows[1][11], "3.5");
        assert_eq!(rows[2][11], "");
        assert_eq!(rows[3][11], "2");
    }

    #[tokio::test]
    async fn filled_or_missing_rows_are_left_alone() {
        let store = seeded();
        let before = store.rows().await;
        assert_eq!(set_actual_performance(&store, SchemaVersion::V1, "Citra", 5.0).await.unwrap(), None);
        assert_eq!(set_actual_performance(&store, SchemaVersion::V1, "Zed", 5.0).await.unwrap(), None);
        assert_eq!(store.rows().await, before);
        assert!(set_actual_performance(&store, SchemaVersion::V1, "Ayu", f64::NAN).await.is_err());
        assert!(set_actual_performance(&store, SchemaVersion::V1, "Ayu", -9.0).await.is_err());
        assert_eq!(store.rows().await, before);
    }

    #[tokio::test]
    async fn short_sheet_rows_count_as_unfilled() {
        let mut short = row("1", "Dewi", "");
        short.truncate(11);
        let store = MemoryStore::with_rows(vec![SchemaVersion::V1.header(), short]);
        assert_eq!(set_actual_performance(&store, SchemaVersion::V1, "Dewi", 4.0).await.unwrap(), Some(2));
        assert_eq!(store.rows().await[1][11], "4");
    }
}
