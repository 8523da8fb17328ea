//! Drives the real ingress router against mock homeserver and bridge HTTP
//! servers, backed by a real (tempdir) SQLite store - mirroring the
//! teacher's `mock_feishu_matrix.rs` harness (`start_*_mock` + `reqwest`
//! against a `salvo::Server`), adapted to the multiplexer's two-directional
//! traffic instead of one bridge pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bridge_manager::config::{AdminConfig, AppserviceConfig, Config, DatabaseConfig, LoggingConfig};
use bridge_manager::store::{
    BridgeRepo, BridgeServiceKind, HomeserverRepo, NewBridge, RoomBridgeRepo, TransactionRepo,
};
use bridge_manager::App;
use salvo::affix_state;
use salvo::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

fn test_config(db_path: &std::path::Path) -> Config {
    Config {
        appservice: AppserviceConfig {
            id: "bridge_manager_1".to_string(),
            namespace: "_bridge_manager__".to_string(),
            as_token: "multiplexer-as-token".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            outbound_timeout_seconds: 5,
        },
        database: DatabaseConfig {
            uri: format!("sqlite:{}", db_path.to_string_lossy()),
            max_open_conns: 4,
            max_idle_conns: 1,
        },
        admin: AdminConfig {
            token: "admin-token".to_string(),
        },
        logging: LoggingConfig {
            min_level: "info".to_string(),
        },
    }
}

async fn start_router(router: Router) -> (String, tokio::task::JoinHandle<()>) {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind test port");
    let addr = probe.local_addr().expect("local addr");
    drop(probe);

    let acceptor = TcpListener::new(format!("127.0.0.1:{}", addr.port())).bind().await;
    let handle = tokio::spawn(async move {
        Server::new(acceptor).serve(router).await;
    });
    (format!("127.0.0.1:{}", addr.port()), handle)
}

#[derive(Clone, Default)]
struct HomeserverMockState {
    ping_calls: Arc<AtomicU64>,
    transaction_calls: Arc<AtomicU64>,
}

async fn start_homeserver_mock(state: HomeserverMockState) -> (String, tokio::task::JoinHandle<()>) {
    #[handler]
    async fn ping_handler(depot: &mut Depot, res: &mut Response) {
        let state: &HomeserverMockState = depot.obtain().expect("mock state present");
        state.ping_calls.fetch_add(1, Ordering::Relaxed);
        res.render(Json(json!({})));
    }

    let router = Router::new()
        .hoop(affix_state::inject(state))
        .push(Router::with_path("_matrix/client/v1/appservice/bridge_manager_1/ping").post(ping_handler));

    let (addr, handle) = start_router(router).await;
    (format!("http://{addr}"), handle)
}

#[derive(Clone, Default)]
struct BridgeMockState {
    transaction_calls: Arc<AtomicU64>,
    last_transaction_body: Arc<std::sync::Mutex<Option<Value>>>,
}

async fn start_bridge_mock(state: BridgeMockState) -> (String, u16, tokio::task::JoinHandle<()>) {
    #[handler]
    async fn transactions_handler(req: &mut Request, depot: &mut Depot, res: &mut Response) {
        let state: &BridgeMockState = depot.obtain().expect("mock state present");
        state.transaction_calls.fetch_add(1, Ordering::Relaxed);
        let body: Value = req.parse_json().await.unwrap_or(Value::Null);
        *state.last_transaction_body.lock().unwrap() = Some(body);
        res.render(Json(json!({})));
    }

    let router = Router::new()
        .hoop(affix_state::inject(state))
        .push(Router::with_path("_matrix/app/v1/transactions/<txn_id>").put(transactions_handler));

    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind test port");
    let addr = probe.local_addr().expect("local addr");
    drop(probe);
    let port = addr.port();
    let acceptor = TcpListener::new(format!("127.0.0.1:{port}")).bind().await;
    let handle = tokio::spawn(async move {
        Server::new(acceptor).serve(router).await;
    });
    (format!("127.0.0.1:{port}"), port, handle)
}

async fn wait_for_http_ready(url: &str) {
    let client = reqwest::Client::builder().no_proxy().build().expect("http client should build");
    for _ in 0..20 {
        if client.get(url).send().await.is_ok() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

async fn build_app(homeserver_url: &str) -> (App, std::path::PathBuf) {
    wait_for_http_ready(homeserver_url).await;
    let db_path = std::env::temp_dir().join(format!("bridge-manager-test-{}.db", Uuid::new_v4()));
    let config = test_config(&db_path);
    let app = App::new(config).await.expect("app should initialize");
    app.store
        .homeservers()
        .create(homeserver_url, "example.org", "hs-token-for-homeserver")
        .await
        .expect("homeserver row should be created");
    (app, db_path)
}

#[tokio::test]
async fn ping_round_trip_establishes_transaction_mapping() {
    let hs_state = HomeserverMockState::default();
    let (hs_url, _hs_handle) = start_homeserver_mock(hs_state.clone()).await;

    let (app, db_path) = build_app(&hs_url).await;
    let bridge = app
        .store
        .bridges()
        .create(NewBridge {
            orchestrator_id: "7".to_string(),
            bridge_service: BridgeServiceKind::Whatsapp,
            as_token: "as-abc".to_string(),
            hs_token: "hs-abc".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 9,
            owner_matrix_username: "@alice:example.org".to_string(),
            matrix_bot_username: "whatsappbot".to_string(),
        })
        .await
        .expect("bridge row should be created");

    let (addr, _ingress_handle) = start_router(app.router()).await;
    wait_for_http_ready(&format!("http://{addr}/health")).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/bridge/_matrix/client/v1/appservice/whatsapp/ping"))
        .bearer_auth(&bridge.as_token)
        .json(&json!({ "transaction_id": "tx42" }))
        .send()
        .await
        .expect("ping request should succeed");
    assert_eq!(response.status().as_u16(), 200);

    assert_eq!(hs_state.ping_calls.load(Ordering::Relaxed), 1, "homeserver should receive the rewritten ping");

    let mapping = app
        .store
        .transactions()
        .get_by_transaction("tx42")
        .await
        .expect("transaction mapping should exist after ping");
    assert_eq!(mapping.bridge_as_token, bridge.as_token);
    assert_eq!(mapping.bridge_id, bridge.id);

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn homeserver_transaction_routes_to_bridge_identified_by_prior_ping() {
    let hs_state = HomeserverMockState::default();
    let (hs_url, _hs_handle) = start_homeserver_mock(hs_state).await;

    let (app, db_path) = build_app(&hs_url).await;
    let bridge_state = BridgeMockState::default();
    let (bridge_addr, bridge_port, _bridge_handle) = start_bridge_mock(bridge_state.clone()).await;
    wait_for_http_ready(&format!("http://{bridge_addr}/_matrix/app/v1/transactions/warmup")).await;
    let bridge_ip = bridge_addr.split(':').next().unwrap().to_string();

    let bridge = app
        .store
        .bridges()
        .create(NewBridge {
            orchestrator_id: "7".to_string(),
            bridge_service: BridgeServiceKind::Whatsapp,
            as_token: "as-abc".to_string(),
            hs_token: "hs-abc".to_string(),
            ip: bridge_ip,
            port: bridge_port,
            owner_matrix_username: "@alice:example.org".to_string(),
            matrix_bot_username: "whatsappbot".to_string(),
        })
        .await
        .expect("bridge row should be created");

    app.store
        .transactions()
        .upsert("tx42", &bridge.as_token, bridge.id)
        .await
        .expect("transaction mapping should be seeded");

    let (addr, _ingress_handle) = start_router(app.router()).await;
    wait_for_http_ready(&format!("http://{addr}/health")).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("http://{addr}/homeserver/_matrix/app/v1/transactions/tx42"))
        .json(&json!({
            "events": [{
                "sender": "@_bridge_manager__whatsapp_7__alice:example.org",
                "type": "m.room.message",
                "room_id": "!r:example.org",
                "content": { "body": "hi" }
            }]
        }))
        .send()
        .await
        .expect("transaction request should succeed");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(bridge_state.transaction_calls.load(Ordering::Relaxed), 1, "the mapped bridge should receive the transaction");

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn empty_transaction_with_no_mapping_returns_bare_ok() {
    let hs_state = HomeserverMockState::default();
    let (hs_url, _hs_handle) = start_homeserver_mock(hs_state).await;
    let (app, db_path) = build_app(&hs_url).await;

    let (addr, _ingress_handle) = start_router(app.router()).await;
    wait_for_http_ready(&format!("http://{addr}/health")).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("http://{addr}/homeserver/_matrix/app/v1/transactions/tx-unknown"))
        .json(&json!({ "events": [] }))
        .send()
        .await
        .expect("transaction request should succeed");
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.expect("body should be json");
    assert_eq!(body, json!({}));

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn room_mapping_resolves_bridge_when_no_username_present() {
    let hs_state = HomeserverMockState::default();
    let (hs_url, _hs_handle) = start_homeserver_mock(hs_state).await;

    let (app, db_path) = build_app(&hs_url).await;
    let bridge_state = BridgeMockState::default();
    let (bridge_addr, bridge_port, _bridge_handle) = start_bridge_mock(bridge_state.clone()).await;
    wait_for_http_ready(&format!("http://{bridge_addr}/_matrix/app/v1/transactions/warmup")).await;
    let bridge_ip = bridge_addr.split(':').next().unwrap().to_string();

    let bridge = app
        .store
        .bridges()
        .create(NewBridge {
            orchestrator_id: "3".to_string(),
            bridge_service: BridgeServiceKind::Whatsapp,
            as_token: "as-room".to_string(),
            hs_token: "hs-room".to_string(),
            ip: bridge_ip,
            port: bridge_port,
            owner_matrix_username: "@bob:example.org".to_string(),
            matrix_bot_username: "whatsappbot".to_string(),
        })
        .await
        .expect("bridge row should be created");

    app.store
        .rooms()
        .upsert("!R:example.org", bridge.id)
        .await
        .expect("room mapping should be seeded");

    let (addr, _ingress_handle) = start_router(app.router()).await;
    wait_for_http_ready(&format!("http://{addr}/health")).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("http://{addr}/homeserver/_matrix/app/v1/transactions/tx-room"))
        .json(&json!({
            "events": [{
                "type": "m.room.message",
                "room_id": "!R:example.org",
                "content": { "body": "no usernames here" }
            }]
        }))
        .send()
        .await
        .expect("transaction request should succeed");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(bridge_state.transaction_calls.load(Ordering::Relaxed), 1, "room mapping should route to bridge 3");

    let _ = std::fs::remove_file(db_path);
}
