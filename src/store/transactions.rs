use async_trait::async_trait;
use diesel::prelude::*;

use super::error::{StoreError, StoreResult};
use super::models::TransactionMapping;
use super::schema::transaction_mappings;
use super::SqlitePool;

#[async_trait]
pub trait TransactionRepo: Send + Sync {
    /// Upsert is permitted to change `bridge_id`/`bridge_as_token` for an
    /// existing `transaction_id` - last writer wins.
    async fn upsert(
        &self,
        transaction_id: &str,
        bridge_as_token: &str,
        bridge_id: i64,
    ) -> StoreResult<()>;
    async fn get_by_transaction(&self, transaction_id: &str) -> StoreResult<TransactionMapping>;
}

#[derive(Queryable)]
struct Row {
    transaction_id: String,
    bridge_as_token: String,
    bridge_id: i64,
}

impl From<Row> for TransactionMapping {
    fn from(row: Row) -> Self {
        TransactionMapping {
            transaction_id: row.transaction_id,
            bridge_as_token: row.bridge_as_token,
            bridge_id: row.bridge_id,
        }
    }
}

#[derive(Clone)]
pub struct SqliteTransactionRepo {
    pool: SqlitePool,
}

impl SqliteTransactionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionRepo for SqliteTransactionRepo {
    async fn upsert(
        &self,
        transaction_id: &str,
        bridge_as_token: &str,
        bridge_id: i64,
    ) -> StoreResult<()> {
        let pool = self.pool.clone();
        let (txn_id, as_token) = (transaction_id.to_string(), bridge_as_token.to_string());
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let mut conn = pool.get()?;
            diesel::insert_into(transaction_mappings::table)
                .values((
                    transaction_mappings::transaction_id.eq(&txn_id),
                    transaction_mappings::bridge_as_token.eq(&as_token),
                    transaction_mappings::bridge_id.eq(bridge_id),
                ))
                .on_conflict(transaction_mappings::transaction_id)
                .do_update()
                .set((
                    transaction_mappings::bridge_as_token.eq(&as_token),
                    transaction_mappings::bridge_id.eq(bridge_id),
                ))
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn get_by_transaction(&self, transaction_id: &str) -> StoreResult<TransactionMapping> {
        let pool = self.pool.clone();
        let txn_id = transaction_id.to_string();
        tokio::task::spawn_blocking(move || -> StoreResult<TransactionMapping> {
            let mut conn = pool.get()?;
            let row: Row = transaction_mappings::table
                .filter(transaction_mappings::transaction_id.eq(&txn_id))
                .first(&mut conn)?;
            Ok(row.into())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }
}
