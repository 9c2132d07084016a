use std::path::PathBuf;

use thiserror::Error;

use crate::weights::WeightError;

/// Erros de configuração de rotas (fatais no load, 4xx no endpoint admin)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read routes file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid routes document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no backends declared")]
    NoBackends,
    #[error("no routes declared")]
    NoRoutes,
    #[error("invalid backend name {0:?}")]
    BadBackendName(String),
    #[error("backend {0} declared more than once")]
    DuplicateBackend(String),
    #[error("{context} references unknown backend {backend}")]
    UnknownBackend { context: String, backend: String },
    #[error("route path {0:?} must start with '/'")]
    BadPath(String),
    #[error("route {0} declared more than once")]
    DuplicateRoute(String),
    #[error("route {route} has invalid method default {method:?}")]
    BadMethod { route: String, method: String },
    #[error("no route with path {0}")]
    UnknownRoute(String),
    #[error("path {0} names both a prefix and an exact route; set \"match\"")]
    AmbiguousRoute(String),
    #[error("route {0} has a fixed target and no weights")]
    FixedRoute(String),
    #[error("ROUTES_FILE is not set")]
    NoRoutesFile,
    #[error(transparent)]
    Weights(#[from] WeightError),
}

/// Falhas de decisão de roteamento em tempo de requisição
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route matches {0}")]
    NoRoute(String),
    #[error("route {0} has no selectable backend")]
    InvalidWeights(String),
}
