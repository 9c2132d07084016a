/// Camada HTTP: estado compartilhado, handler de proxy e endpoints admin
use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router as HttpRouter,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{
        HeaderMap, HeaderName, Method, StatusCode, Uri,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
    affinity::{AffinityStore, Clock},
    annotate::{self, CookieSettings},
    config::Cfg,
    error::{ConfigError, RouteError},
    router::{RouteRequest, Router},
    routes::{PathMatch, RouteTable, RoutingConfig},
    upstream::Dispatcher,
    weights::{RandomSource, WeightEntry},
};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Cfg>,
    pub routes: Arc<RouteTable>,
    pub affinity: Arc<AffinityStore>,
    pub router: Arc<Router>,
    upstream: Dispatcher,
    backend_header: HeaderName,
    cookie: Arc<CookieSettings>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        cfg: Cfg,
        routing: RoutingConfig,
        rng: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        routing.validate()?;
        let backend_header = HeaderName::try_from(cfg.backend_header.as_str())?;
        let ttl = Duration::from_secs(cfg.affinity_ttl_secs);
        let cookie = Arc::new(CookieSettings {
            name: cfg.cookie_name.clone(),
            secure: cfg.cookie_secure,
        });

        let routes = Arc::new(RouteTable::new(routing));
        let affinity = Arc::new(AffinityStore::with_clock(ttl, clock));
        let router = Arc::new(
            Router::new(routes.clone(), affinity.clone(), rng).adopt_unknown_tokens(cfg.adopt_client_tokens),
        );
        if cfg.admin_token.is_none() {
            warn!("ADMIN_TOKEN not set: admin write endpoints are open");
        }
        let upstream = Dispatcher::new(&cfg)?;

        Ok(Self {
            cfg: Arc::new(cfg),
            routes,
            affinity,
            router,
            upstream,
            backend_header,
            cookie,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn app(state: AppState) -> HttpRouter {
    let admin = HttpRouter::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(render_metrics))
        .route("/routes", get(show_routes))
        .route("/routes/weights", put(set_weights))
        .route("/reload", post(reload));

    HttpRouter::new()
        .nest("/_forklift", admin)
        .fallback(proxy)
        .layer(DefaultBodyLimit::max(state.cfg.max_body_bytes))
        .layer(ConcurrencyLimitLayer::new(state.cfg.concurrency_limit))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Relê ROUTES_FILE e troca o snapshot; a configuração atual fica se algo falhar
pub async fn reload_routes(st: &AppState) -> Result<u64, ConfigError> {
    let path = st.cfg.routes_file.as_deref().ok_or(ConfigError::NoRoutesFile)?;
    let cfg = RoutingConfig::load(path).await?;
    st.routes.replace(cfg)
}

async fn proxy(
    State(st): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let token = annotate::session_token(&headers, &st.cookie.name);
    let content_type = headers.get(CONTENT_TYPE).cloned();

    let decision = st
        .router
        .route(RouteRequest {
            path: uri.path(),
            method: &method,
            content_type: content_type.as_ref().and_then(|v| v.to_str().ok()),
            body: &body,
            token,
        })
        .map_err(|e| match e {
            RouteError::NoRoute(_) => (StatusCode::NOT_FOUND, e.to_string()),
            RouteError::InvalidWeights(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })?;

    // backend pode ter sumido num reload entre a decisão e aqui
    let backend = st
        .routes
        .snapshot()
        .backend(&decision.backend)
        .cloned()
        .ok_or_else(|| {
            warn!(backend = %decision.backend, "backend vanished after routing");
            (StatusCode::BAD_GATEWAY, format!("backend {} unavailable", decision.backend))
        })?;

    let path_and_query = uri.path_and_query().map_or("/", |p| p.as_str());
    let resp = st
        .upstream
        .forward(&backend, method, path_and_query, content_type, body)
        .await
        .map_err(|e| {
            warn!("{e}");
            metrics::counter!("forklift_upstream_errors_total", "backend" => decision.backend.clone())
                .increment(1);
            (StatusCode::BAD_GATEWAY, e.to_string())
        })?;

    let mut out = (resp.status, resp.body).into_response();
    if let Some(ct) = resp.content_type {
        out.headers_mut().insert(CONTENT_TYPE, ct);
    }
    annotate::annotate(out.headers_mut(), &st.backend_header, &decision, &st.cookie);
    Ok(out)
}

// ========== ADMIN ==========

/// Escritas admin exigem `Authorization: Bearer <ADMIN_TOKEN>` quando configurado
fn authorize(st: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let Some(required) = st.cfg.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(t) if bool::from(t.as_bytes().ct_eq(required.as_bytes())) => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, "unauthorized".into())),
    }
}

fn config_status(e: &ConfigError) -> StatusCode {
    match e {
        ConfigError::UnknownRoute(_) => StatusCode::NOT_FOUND,
        ConfigError::FixedRoute(_) | ConfigError::AmbiguousRoute(_) | ConfigError::NoRoutesFile => {
            StatusCode::CONFLICT
        }
        ConfigError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

async fn render_metrics(State(st): State<AppState>) -> Result<String, (StatusCode, String)> {
    match &st.metrics {
        Some(h) => Ok(h.render()),
        None => Err((StatusCode::NOT_FOUND, "metrics recorder not installed".into())),
    }
}

#[derive(Serialize)]
struct RoutesView {
    version: u64,
    sessions: usize,
    #[serde(flatten)]
    config: RoutingConfig,
}

async fn show_routes(State(st): State<AppState>) -> Json<RoutesView> {
    Json(RoutesView {
        version: st.routes.version(),
        sessions: st.affinity.len(),
        config: RoutingConfig::clone(&st.routes.snapshot()),
    })
}

#[derive(Deserialize)]
struct WeightsUpdate {
    path: String,
    /// Obrigatório só quando o mesmo path tem rota exata e de prefixo
    #[serde(default, rename = "match")]
    path_match: Option<PathMatch>,
    weights: Vec<WeightEntry>,
}

async fn set_weights(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WeightsUpdate>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    authorize(&st, &headers)?;
    match st.routes.update_weights(&body.path, body.path_match, body.weights) {
        Ok(version) => Ok(Json(serde_json::json!({ "version": version }))),
        Err(e) => {
            warn!(route = %body.path, "weights update rejected: {e}");
            Err((config_status(&e), e.to_string()))
        }
    }
}

async fn reload(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    authorize(&st, &headers)?;
    match reload_routes(&st).await {
        Ok(version) => {
            info!(version, "routes reloaded");
            Ok(Json(serde_json::json!({ "version": version })))
        }
        Err(e) => {
            error!("reload failed, keeping current routes: {e}");
            Err((config_status(&e), e.to_string()))
        }
    }
}
