pub mod bridges;
pub mod error;
pub mod homeservers;
pub mod models;
pub mod requests;
pub mod rooms;
mod schema;
pub mod transactions;

pub use bridges::{BridgeLookup, BridgeRepo, SqliteBridgeRepo};
pub use error::{StoreError, StoreResult};
pub use homeservers::{HomeserverRepo, SqliteHomeserverRepo};
pub use models::*;
pub use requests::{RequestRepo, SqliteRequestRepo};
pub use rooms::{RoomBridgeRepo, SqliteRoomBridgeRepo};
pub use transactions::{SqliteTransactionRepo, TransactionRepo};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use tracing::info;

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS homeservers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    name TEXT NOT NULL UNIQUE,
    hs_token TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bridges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    orchestrator_id TEXT NOT NULL UNIQUE,
    bridge_service TEXT NOT NULL,
    as_token TEXT NOT NULL UNIQUE,
    hs_token TEXT NOT NULL,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    owner_matrix_username TEXT NOT NULL,
    matrix_bot_username TEXT NOT NULL,
    live_status TEXT NOT NULL DEFAULT 'unknown',
    ready_status TEXT NOT NULL DEFAULT 'unknown',
    status_updated_at TEXT NOT NULL,
    bridge_management_room_id TEXT,
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS transaction_mappings (
    transaction_id TEXT PRIMARY KEY,
    bridge_as_token TEXT NOT NULL,
    bridge_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS room_bridge_mappings (
    room_id TEXT PRIMARY KEY,
    bridge_id INTEGER NOT NULL,
    last_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    inbound_at TEXT NOT NULL,
    outbound_at TEXT,
    source TEXT NOT NULL,
    bridge_id INTEGER,
    homeserver_id INTEGER,
    bridge_discovery_method TEXT,
    discovery_error TEXT,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    inbound_request TEXT NOT NULL,
    outbound_request TEXT,
    response TEXT,
    response_status INTEGER
);

CREATE INDEX IF NOT EXISTS idx_bridges_orchestrator_id ON bridges(orchestrator_id);
CREATE INDEX IF NOT EXISTS idx_bridges_as_token ON bridges(as_token);
CREATE INDEX IF NOT EXISTS idx_bridges_owner_service ON bridges(owner_matrix_username, bridge_service);
CREATE INDEX IF NOT EXISTS idx_requests_bridge_id ON requests(bridge_id);
"#;

/// Owns every persisted table described in the data model: homeservers,
/// bridges, transaction mappings, room-bridge mappings, and the request
/// audit log. Repositories are obtained via the `*_repo` accessors; each one
/// shares this pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_uri: &str, max_open: u32, max_idle: u32) -> Result<Self> {
        info!("Connecting to sqlite database: {}", db_uri);

        let db_path = sqlite_path_from_uri(db_uri)?;
        let is_memory = db_path == Path::new(":memory:");
        if !is_memory {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let max_size = max_open.max(1);
        let min_idle = Some(max_idle.min(max_size));
        let db_url = db_path.to_string_lossy().to_string();

        let pool = tokio::task::spawn_blocking(move || -> Result<SqlitePool> {
            let manager = ConnectionManager::<SqliteConnection>::new(db_url);
            let pool = Pool::builder()
                .max_size(max_size)
                .min_idle(min_idle)
                .build(manager)?;
            Ok(pool)
        })
        .await
        .context("sqlite pool init task panicked")??;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running store migrations");
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            conn.batch_execute(MIGRATIONS)?;
            Ok(())
        })
        .await
        .context("migration task panicked")??;
        info!("Store migrations completed");
        Ok(())
    }

    pub fn homeservers(&self) -> SqliteHomeserverRepo {
        SqliteHomeserverRepo::new(self.pool.clone())
    }

    pub fn bridges(&self) -> SqliteBridgeRepo {
        SqliteBridgeRepo::new(self.pool.clone())
    }

    pub fn transactions(&self) -> SqliteTransactionRepo {
        SqliteTransactionRepo::new(self.pool.clone())
    }

    pub fn rooms(&self) -> SqliteRoomBridgeRepo {
        SqliteRoomBridgeRepo::new(self.pool.clone())
    }

    pub fn requests(&self) -> SqliteRequestRepo {
        SqliteRequestRepo::new(self.pool.clone())
    }
}

fn sqlite_path_from_uri(db_uri: &str) -> Result<PathBuf> {
    if db_uri.is_empty() {
        anyhow::bail!("database uri cannot be empty");
    }
    let path = db_uri
        .strip_prefix("sqlite://")
        .or_else(|| db_uri.strip_prefix("sqlite:"))
        .unwrap_or(db_uri);
    if path.is_empty() {
        anyhow::bail!("database uri '{}' does not contain a sqlite path", db_uri);
    }
    Ok(PathBuf::from(path))
}
