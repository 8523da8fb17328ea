//! Wires every layer together and owns the server loop: store pool, identity
//! translator, bridge registry/resolver, the homeserver service, and the
//! three routers (`ingress`, `web::health`, `web::admin`) served from one
//! `salvo::Server`.

use std::sync::Arc;

use anyhow::{Context, Result};
use salvo::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::context::ContextDeps;
use crate::identity::IdentityTranslator;
use crate::registry::BridgeRegistry;
use crate::resolver::BridgeResolver;
use crate::services::homeserver_service::HomeserverService;
use crate::store::Store;
use crate::{ingress, web};

#[derive(Clone)]
pub struct App {
    pub config: Config,
    pub store: Store,
    pub registry: BridgeRegistry,
    pub homeserver_service: Arc<HomeserverService>,
    pub deps: ContextDeps,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::connect(
            &config.database.uri,
            config.database.max_open_conns,
            config.database.max_idle_conns,
        )
        .await
        .context("failed to connect to store")?;
        store.run_migrations().await.context("failed to run store migrations")?;

        let identity = IdentityTranslator::new(&config.appservice.namespace).context("invalid appservice namespace")?;

        let homeserver_service = Arc::new(HomeserverService::new(
            config.appservice.as_token.clone(),
            config.appservice.outbound_timeout_seconds,
        ));

        let registry = BridgeRegistry::new(
            store.bridges(),
            store.transactions(),
            store.rooms(),
            homeserver_service.clone(),
            identity.clone(),
            config.clone(),
        );

        let resolver = BridgeResolver::new(registry.clone(), store.transactions(), store.rooms(), identity.clone());

        let deps = ContextDeps {
            requests: store.requests(),
            resolver,
            homeservers: store.homeservers(),
            identity,
        };

        Ok(Self {
            config,
            store,
            registry,
            homeserver_service,
            deps,
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .push(web::health::router())
            .push(web::metrics::router())
            .push(web::admin::router(self.store.clone(), self.registry.clone(), self.config.admin.token.clone()))
            .push(ingress::router(self.deps.clone(), self.homeserver_service.clone()))
    }

    pub async fn start(&self) -> Result<()> {
        let router = self.router();
        let addr = format!("{}:{}", self.config.appservice.host, self.config.appservice.port);
        let acceptor = TcpListener::new(&addr).bind().await;

        info!("bridge manager listening on {}", addr);
        Server::new(acceptor).serve(router).await;
        Ok(())
    }
}
