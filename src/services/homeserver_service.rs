//! Everything that talks to the real Matrix homeserver: a thin outbound
//! client used by [`super::bridge_service`] to forward bridge-originated
//! client-API calls, and the inbound dispatcher for traffic the homeserver
//! delivers to this appservice (`ping`, namespaced `users/`, `transactions/`).

use crate::error::{AppError, AppResult};
use crate::http_client::HttpClient;
use crate::identity::{Direction, IdentityTranslator};
use crate::route::RouteRegistry;
use crate::services::bridge_service::BridgeServiceHandle;
use crate::services::{dispatch, ServiceRequest, ServiceResponse};
use crate::store::Homeserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundEndpoint {
    Ping,
    Users,
    Transactions,
}

pub struct HomeserverService {
    http: HttpClient,
    as_token: String,
    timeout_seconds: u64,
    routes: RouteRegistry<InboundEndpoint>,
}

impl HomeserverService {
    pub fn new(as_token: String, timeout_seconds: u64) -> Self {
        let mut routes = RouteRegistry::new();
        routes.add_exact("_matrix/app/v1/ping", InboundEndpoint::Ping, Some("multiplexer liveness"));
        routes.add_prefix(
            "_matrix/app/v1/users/",
            InboundEndpoint::Users,
            Some("namespaced user id lookup"),
        );
        routes.add_prefix(
            "_matrix/app/v1/transactions/",
            InboundEndpoint::Transactions,
            Some("event transaction delivery"),
        );
        Self {
            http: HttpClient::new(),
            as_token,
            timeout_seconds,
            routes,
        }
    }

    /// Forwards a request originated by a bridge onward to the real
    /// homeserver, presenting this multiplexer's own `as_token`.
    pub async fn forward(&self, req: &ServiceRequest, homeserver: &Homeserver, path: &str) -> AppResult<ServiceResponse> {
        dispatch(&self.http, &homeserver.url, req, path, &self.as_token, self.timeout_seconds).await
    }

    /// Handles a request the real homeserver delivered to this appservice,
    /// dispatching it onward to `resolved` (the bridge `BridgeResolver`
    /// already identified for this request, if any).
    pub async fn handle_inbound(
        &self,
        req: &ServiceRequest,
        resolved: Option<&BridgeServiceHandle>,
        identity: &IdentityTranslator,
        hs_name: &str,
    ) -> AppResult<ServiceResponse> {
        match self.routes.match_path(&req.path) {
            Some(InboundEndpoint::Ping) => Ok(ServiceResponse::empty_ok()),
            Some(InboundEndpoint::Users) => self.handle_users(req, resolved, identity, hs_name).await,
            Some(InboundEndpoint::Transactions) => self.handle_transactions(req, resolved, identity, hs_name).await,
            None => Err(AppError::RouteNotFound(format!(
                "homeserver-originated path not handled: {}",
                req.path
            ))),
        }
    }

    async fn handle_users(
        &self,
        req: &ServiceRequest,
        resolved: Option<&BridgeServiceHandle>,
        identity: &IdentityTranslator,
        hs_name: &str,
    ) -> AppResult<ServiceResponse> {
        let resolved = resolved.ok_or_else(|| {
            AppError::BridgeNotFound(format!("no bridge resolved for users path: {}", req.path))
        })?;
        let new_path = identity.rewrite_text(&req.path, Direction::ToBridge, &resolved.bridge, hs_name);
        resolved.forward_to_bridge(req, Some(new_path)).await
    }

    async fn handle_transactions(
        &self,
        req: &ServiceRequest,
        resolved: Option<&BridgeServiceHandle>,
        _identity: &IdentityTranslator,
        _hs_name: &str,
    ) -> AppResult<ServiceResponse> {
        let resolved = resolved.ok_or_else(|| {
            AppError::BridgeNotFound(format!("no bridge resolved for transaction: {}", req.path))
        })?;

        // Body forwarded unchanged: bridges accept encoded usernames directly
        // in transaction events, and rewriting here was tried and abandoned
        // upstream.
        resolved.forward_to_bridge(req, None).await
    }
}
