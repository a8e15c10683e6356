//! Admin HTTP surface.
//!
//! A thin axum layer over the service: path-parameter routes, product-auth
//! token segments on mutating calls, JSON bodies everywhere. All decisions
//! live in the service; handlers only validate parameter shape.

use crate::error::CacheMgrError;
use crate::service::Service;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PORT_MIN: u16 = 10000;
const PORT_MAX: u16 = 59999;

fn valid_port(port: u16) -> bool {
    (PORT_MIN..=PORT_MAX).contains(&port)
}

type AppState = Arc<Service>;

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!(self.1))).into_response()
    }
}

impl From<CacheMgrError> for ApiError {
    fn from(e: CacheMgrError) -> Self {
        let status = if e.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ApiError(status, e.to_string())
    }
}

fn bad_request(message: &str) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.to_string())
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(serde_json::Value::Null))
}

fn check_auth(service: &Service, xauth: &str) -> Result<(), ApiError> {
    let expected = &service.config().product_auth;
    if !expected.is_empty() && xauth != expected {
        return Err(ApiError(
            StatusCode::UNAUTHORIZED,
            "invalid auth token".to_string(),
        ));
    }
    Ok(())
}

/// Build the full admin router.
pub fn router(service: AppState) -> Router {
    let api = Router::new()
        .route("/stats/{xauth}", get(stats_authed))
        .route("/group/create/{xauth}/{gname}/{rport}/{wport}", put(group_create))
        .route("/group/remove/{xauth}/{gname}", put(group_remove))
        .route("/group/resync/{xauth}/{gname}", put(group_resync))
        .route("/group/resync-all/{xauth}", put(group_resync_all))
        .route("/group/add/{xauth}/{gname}/{addr}", put(group_add_server))
        .route("/group/del/{xauth}/{gname}/{addr}", put(group_del_server))
        .route("/group/promote/{xauth}/{gname}/{addr}", put(group_promote))
        .route(
            "/group/force-full-sync/{xauth}/{gname}/{addr}",
            put(group_force_full_sync),
        )
        .route("/group/info/{addr}", get(group_server_info))
        .route("/sentinels/add/{xauth}/{addr}", put(sentinel_add))
        .route("/sentinels/del/{xauth}/{addr}/{force}", put(sentinel_del))
        .route("/sentinels/resync-all/{xauth}", put(sentinel_resync_all))
        .route("/sentinels/info/{addr}", get(sentinel_info))
        .route("/sentinels/info/{addr}/monitored", get(sentinel_monitored_info))
        .route("/gslbs/add/{xauth}/{gslbname}/{addr}", put(gslb_add))
        .route("/gslbs/del/{xauth}/{gslbname}/{addr}", put(gslb_del))
        .route("/gslbs/info/{addr}/monitored", get(gslb_monitored_info))
        .route("/tf/info/{filename}", get(template_file_info));

    Router::new()
        .route("/topom", get(topom_overview))
        .route("/topom/model", get(topom_model))
        .route("/topom/stats", get(topom_stats))
        .nest("/api/topom", api)
        .layer(middleware::from_fn(record_source))
        .with_state(service)
}

/// Serve the admin API until the shutdown token fires.
pub async fn serve(
    service: AppState,
    addr: &str,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CacheMgrError::Network(format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "admin api listening");

    let app = router(service);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| CacheMgrError::Network(format!("admin api: {}", e)))
}

async fn record_source(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if method == axum::http::Method::GET {
        debug!(%method, %path, "api call");
    } else {
        info!(%method, %path, "api call");
    }
    next.run(request).await
}

// ---- aggregate -----------------------------------------------------

async fn topom_overview(State(service): State<AppState>) -> ApiResult {
    let overview = service.overview().await;
    Ok(Json(serde_json::to_value(overview).map_err(CacheMgrError::from)?))
}

async fn topom_model(State(service): State<AppState>) -> ApiResult {
    Ok(Json(serde_json::to_value(service.topom()).map_err(CacheMgrError::from)?))
}

async fn topom_stats(State(service): State<AppState>) -> ApiResult {
    Ok(Json(serde_json::to_value(service.stats().await).map_err(CacheMgrError::from)?))
}

async fn stats_authed(
    State(service): State<AppState>,
    Path(xauth): Path<String>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    Ok(Json(serde_json::to_value(service.stats().await).map_err(CacheMgrError::from)?))
}

// ---- groups --------------------------------------------------------

async fn group_create(
    State(service): State<AppState>,
    Path((xauth, gname, rport, wport)): Path<(String, String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    if gname.is_empty() {
        return Err(bad_request("group name invalid"));
    }
    let rport: u16 = rport
        .parse()
        .ok()
        .filter(|p| valid_port(*p))
        .ok_or_else(|| bad_request("proxy read port invalid"))?;
    let wport: u16 = wport
        .parse()
        .ok()
        .filter(|p| valid_port(*p))
        .ok_or_else(|| bad_request("proxy write port invalid"))?;
    service.create_group(&gname, rport, wport).await?;
    ok()
}

async fn group_remove(
    State(service): State<AppState>,
    Path((xauth, gname)): Path<(String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.remove_group(&gname).await?;
    ok()
}

async fn group_resync(
    State(service): State<AppState>,
    Path((xauth, gname)): Path<(String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.resync_group(&gname).await?;
    ok()
}

async fn group_resync_all(
    State(service): State<AppState>,
    Path(xauth): Path<String>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.resync_group_all().await?;
    ok()
}

async fn group_add_server(
    State(service): State<AppState>,
    Path((xauth, gname, addr)): Path<(String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.add_group_server(&gname, &addr).await?;
    ok()
}

async fn group_del_server(
    State(service): State<AppState>,
    Path((xauth, gname, addr)): Path<(String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.del_group_server(&gname, &addr).await?;
    ok()
}

async fn group_promote(
    State(service): State<AppState>,
    Path((xauth, gname, addr)): Path<(String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.promote_group_server(&gname, &addr).await?;
    ok()
}

async fn group_force_full_sync(
    State(service): State<AppState>,
    Path((xauth, gname, addr)): Path<(String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.force_full_sync_server(&gname, &addr).await?;
    ok()
}

async fn group_server_info(
    State(service): State<AppState>,
    Path(addr): Path<String>,
) -> ApiResult {
    let text = service.server_info(&addr).await?;
    Ok(Json(json!(text)))
}

// ---- sentinels -----------------------------------------------------

async fn sentinel_add(
    State(service): State<AppState>,
    Path((xauth, addr)): Path<(String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.add_sentinel(&addr).await?;
    ok()
}

async fn sentinel_del(
    State(service): State<AppState>,
    Path((xauth, addr, force)): Path<(String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    let force = force
        .parse::<i64>()
        .map(|v| v != 0)
        .map_err(|_| bad_request("force flag invalid"))?;
    service.del_sentinel(&addr, force).await?;
    ok()
}

async fn sentinel_resync_all(
    State(service): State<AppState>,
    Path(xauth): Path<String>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.resync_sentinels().await?;
    ok()
}

async fn sentinel_info(
    State(service): State<AppState>,
    Path(addr): Path<String>,
) -> ApiResult {
    let text = service.sentinel_info(&addr).await?;
    Ok(Json(json!(text)))
}

async fn sentinel_monitored_info(
    State(service): State<AppState>,
    Path(addr): Path<String>,
) -> ApiResult {
    let monitored = service.sentinel_monitored_info(&addr).await?;
    Ok(Json(serde_json::to_value(monitored).map_err(CacheMgrError::from)?))
}

// ---- gslbs ---------------------------------------------------------

async fn gslb_add(
    State(service): State<AppState>,
    Path((xauth, gslbname, addr)): Path<(String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.add_gslb(&gslbname, &addr).await?;
    ok()
}

async fn gslb_del(
    State(service): State<AppState>,
    Path((xauth, gslbname, addr)): Path<(String, String, String)>,
) -> ApiResult {
    check_auth(&service, &xauth)?;
    service.del_gslb(&gslbname, &addr).await?;
    ok()
}

async fn gslb_monitored_info(
    State(service): State<AppState>,
    Path(addr): Path<String>,
) -> ApiResult {
    let body = service.gslb_monitor_info(&addr).await?;
    Ok(Json(json!(String::from_utf8_lossy(&body).into_owned())))
}

// ---- template files ------------------------------------------------

async fn template_file_info(
    State(service): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult {
    let data = service.view_template_file(&filename)?;
    Ok(Json(json!(String::from_utf8_lossy(&data).into_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_port_range() {
        assert!(valid_port(10000));
        assert!(valid_port(59999));
        assert!(!valid_port(9999));
        assert!(!valid_port(60000));
    }
}
