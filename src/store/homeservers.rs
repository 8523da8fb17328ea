use async_trait::async_trait;
use diesel::prelude::*;

use super::error::{StoreError, StoreResult};
use super::models::Homeserver;
use super::schema::homeservers;
use super::SqlitePool;

#[async_trait]
pub trait HomeserverRepo: Send + Sync {
    async fn get_by_id(&self, id: i64) -> StoreResult<Homeserver>;
    async fn get_by_name(&self, name: &str) -> StoreResult<Homeserver>;
    async fn create(&self, url: &str, name: &str, hs_token: &str) -> StoreResult<Homeserver>;
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = homeservers)]
struct Row {
    id: i64,
    url: String,
    name: String,
    hs_token: String,
}

impl From<Row> for Homeserver {
    fn from(row: Row) -> Self {
        Homeserver {
            id: row.id,
            url: row.url,
            name: row.name,
            hs_token: row.hs_token,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = homeservers)]
struct NewRow<'a> {
    url: &'a str,
    name: &'a str,
    hs_token: &'a str,
}

#[derive(Clone)]
pub struct SqliteHomeserverRepo {
    pool: SqlitePool,
}

impl SqliteHomeserverRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HomeserverRepo for SqliteHomeserverRepo {
    async fn get_by_id(&self, id: i64) -> StoreResult<Homeserver> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Homeserver> {
            let mut conn = pool.get()?;
            let row: Row = homeservers::table.find(id).first(&mut conn)?;
            Ok(row.into())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn get_by_name(&self, name: &str) -> StoreResult<Homeserver> {
        let pool = self.pool.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> StoreResult<Homeserver> {
            let mut conn = pool.get()?;
            let row: Row = homeservers::table
                .filter(homeservers::name.eq(&name))
                .first(&mut conn)?;
            Ok(row.into())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn create(&self, url: &str, name: &str, hs_token: &str) -> StoreResult<Homeserver> {
        let pool = self.pool.clone();
        let (url, name, hs_token) = (url.to_string(), name.to_string(), hs_token.to_string());
        tokio::task::spawn_blocking(move || -> StoreResult<Homeserver> {
            let mut conn = pool.get()?;
            diesel::insert_into(homeservers::table)
                .values(&NewRow {
                    url: &url,
                    name: &name,
                    hs_token: &hs_token,
                })
                .execute(&mut conn)?;
            let row: Row = homeservers::table
                .filter(homeservers::name.eq(&name))
                .first(&mut conn)?;
            Ok(row.into())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }
}
