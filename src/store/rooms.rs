use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;

use super::error::{StoreError, StoreResult};
use super::schema::room_bridge_mappings;
use super::SqlitePool;

#[async_trait]
pub trait RoomBridgeRepo: Send + Sync {
    async fn upsert(&self, room_id: &str, bridge_id: i64) -> StoreResult<()>;
    async fn get_bridge_id_by_room(&self, room_id: &str) -> StoreResult<i64>;
}

#[derive(Clone)]
pub struct SqliteRoomBridgeRepo {
    pool: SqlitePool,
}

impl SqliteRoomBridgeRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomBridgeRepo for SqliteRoomBridgeRepo {
    async fn upsert(&self, room_id: &str, bridge_id: i64) -> StoreResult<()> {
        let pool = self.pool.clone();
        let room_id = room_id.to_string();
        let now = Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let mut conn = pool.get()?;
            diesel::insert_into(room_bridge_mappings::table)
                .values((
                    room_bridge_mappings::room_id.eq(&room_id),
                    room_bridge_mappings::bridge_id.eq(bridge_id),
                    room_bridge_mappings::last_seen_at.eq(&now),
                ))
                .on_conflict(room_bridge_mappings::room_id)
                .do_update()
                .set((
                    room_bridge_mappings::bridge_id.eq(bridge_id),
                    room_bridge_mappings::last_seen_at.eq(&now),
                ))
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn get_bridge_id_by_room(&self, room_id: &str) -> StoreResult<i64> {
        let pool = self.pool.clone();
        let room_id = room_id.to_string();
        tokio::task::spawn_blocking(move || -> StoreResult<i64> {
            let mut conn = pool.get()?;
            let bridge_id: i64 = room_bridge_mappings::table
                .filter(room_bridge_mappings::room_id.eq(&room_id))
                .select(room_bridge_mappings::bridge_id)
                .first(&mut conn)?;
            Ok(bridge_id)
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }
}
