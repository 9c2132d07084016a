/// Despacho para o backend escolhido
/// Backends locais respondem "Hello from <nome>"; backends com URL são repassados
/// com um cliente HTTP compartilhado (pool de conexões)
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, header::CONTENT_TYPE};
use reqwest::Client;
use thiserror::Error;

use crate::{config::Cfg, routes::BackendSpec};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream {backend} error: {source}")]
    Request {
        backend: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Resposta já materializada do upstream
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// Cliente de despacho; clonável, compartilha o pool HTTP
#[derive(Clone)]
pub struct Dispatcher {
    http: Arc<Client>,
}

impl Dispatcher {
    pub fn new(cfg: &Cfg) -> anyhow::Result<Self> {
        // ========== CONFIGURAÇÕES DE PERFORMANCE ==========
        let http = Client::builder()
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;

        Ok(Self {
            http: Arc::new(http),
        })
    }

    /// Encaminha a requisição original (método, path+query, content-type e corpo)
    pub async fn forward(
        &self,
        backend: &BackendSpec,
        method: Method,
        path_and_query: &str,
        content_type: Option<HeaderValue>,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let Some(base) = backend.url.as_deref() else {
            return Ok(local_reply(&backend.name));
        };

        let start = std::time::Instant::now();
        let url = format!("{}{path_and_query}", base.trim_end_matches('/'));
        let mut req = self.http.request(method, &url).body(body);
        if let Some(ct) = content_type {
            req = req.header(CONTENT_TYPE, ct);
        }

        let wrap = |source| UpstreamError::Request {
            backend: backend.name.clone(),
            source,
        };
        let resp = req.send().await.map_err(wrap)?;
        let status = resp.status();
        let content_type = resp.headers().get(CONTENT_TYPE).cloned();
        let body = resp.bytes().await.map_err(wrap)?;

        metrics::histogram!("forklift_upstream_latency_ms", "backend" => backend.name.clone())
            .record(start.elapsed().as_millis() as f64);

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

fn local_reply(name: &str) -> UpstreamResponse {
    UpstreamResponse {
        status: StatusCode::OK,
        content_type: Some(HeaderValue::from_static("text/plain; charset=utf-8")),
        body: Bytes::from(format!("Hello from {name}\n")),
    }
}
