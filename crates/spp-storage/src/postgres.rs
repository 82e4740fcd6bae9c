use async_trait::async_trait;
use spp_core::Row;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row as _};
use tracing::info;

use crate::{PartialAppend, StoreError, TabularStore};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS spp_grid_rows (
    row_index BIGINT PRIMARY KEY,
    cells TEXT[] NOT NULL
)
"#;

/// Grid kept in a Postgres table, one array of cells per row.
#[derive(Debug, Clone)]
pub struct PgGridStore {
    pool: PgPool,
}

impl PgGridStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        info!("postgres grid store ready");
        Ok(Self { pool })
    }
}

fn decode_cells(cells: Vec<Option<String>>) -> Row {
    cells.into_iter().map(Option::unwrap_or_default).collect()
}

#[async_trait]
impl TabularStore for PgGridStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn read_all(&self) -> Result<Vec<Row>, StoreError> {
        let rows = sqlx::query("SELECT cells FROM spp_grid_rows ORDER BY row_index")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(decode_cells(row.try_get::<Vec<Option<String>>, _>("cells")?)))
            .collect()
    }

    async fn read_header(&self) -> Result<Option<Row>, StoreError> {
        let row = sqlx::query("SELECT cells FROM spp_grid_rows ORDER BY row_index LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(decode_cells(row.try_get("cells")?))),
            None => Ok(None),
        }
    }

    async fn row_count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM spp_grid_rows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn append_row(&self, row: Row) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO spp_grid_rows (row_index, cells)
            SELECT COALESCE(MAX(row_index), 0) + 1, $1 FROM spp_grid_rows
            "#,
        )
        .bind(row)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Runs in one transaction: the batch lands entirely or not at all.
    async fn append_rows(&self, rows: &[Row]) -> Result<(), PartialAppend> {
        let wrap = |err: sqlx::Error| PartialAppend {
            committed: 0,
            source: StoreError::Database(err),
        };
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO spp_grid_rows (row_index, cells)
                SELECT COALESCE(MAX(row_index), 0) + 1, $1 FROM spp_grid_rows
                "#,
            )
            .bind(row.clone())
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        }
        tx.commit().await.map_err(wrap)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM spp_grid_rows")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_cell(&self, row: usize, col: usize, value: String) -> Result<(), StoreError> {
        if row == 0 || col == 0 {
            return Err(StoreError::Invalid(format!(
                "cell ({row}, {col}) is out of range; indices are 1-based"
            )));
        }
        let result = sqlx::query(
            r#"
            UPDATE spp_grid_rows
               SET cells[$2] = $3
             WHERE row_index = (
                   SELECT row_index FROM spp_grid_rows
                    ORDER BY row_index
                   OFFSET $1 LIMIT 1)
            "#,
        )
        .bind((row - 1) as i64)
        .bind(col as i32)
        .bind(value)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Invalid(format!("row {row} is out of range")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_padding_cells_read_as_empty() {
        let row = decode_cells(vec![Some("1".into()), None, Some("x".into())]);
        assert_eq!(row, vec!["1".to_string(), String::new(), "x".to_string()]);
    }
}
