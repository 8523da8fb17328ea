use salvo::prelude::*;

pub fn router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_endpoint))
        .push(Router::with_path("ready").get(ready_endpoint))
}

#[handler]
pub async fn health_endpoint(res: &mut Response) {
    res.status_code(StatusCode::OK);
    res.render(Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })));
}

#[handler]
pub async fn ready_endpoint(res: &mut Response) {
    res.status_code(StatusCode::OK);
    res.render(Json(serde_json::json!({
        "ready": true
    })));
}
