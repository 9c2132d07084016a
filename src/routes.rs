/// Topologia de roteamento: backends, rotas e regras de override
/// Carregada de um JSON (ROUTES_FILE) ou da topologia embutida
/// O snapshot ativo fica atrás de um ArcSwap: leitores nunca bloqueiam e cada
/// decisão enxerga exatamente uma versão da configuração
use std::{
    borrow::Cow,
    collections::{BTreeMap, HashSet},
    path::Path,
    str::FromStr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use http::Method;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::ConfigError,
    overrides::OverrideResolver,
    weights::{WeightEntry, WeightTable},
};

/// Backend nomeado; sem `url` é respondido localmente ("Hello from <name>")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl BackendSpec {
    pub fn local(name: &str) -> Self {
        Self {
            name: name.into(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    #[default]
    Prefix,
    Exact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// Destino único; ignora override, afinidade e pesos
    Fixed(String),
    Weighted(WeightTable),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub path: String,
    #[serde(default, rename = "match")]
    pub path_match: PathMatch,
    pub target: RouteTarget,
    /// Método HTTP -> backend, aplicado quando não há override (ex.: POST -> V1)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub method_defaults: BTreeMap<String, String>,
}

impl RouteSpec {
    /// Escopo da afinidade desta rota; prefixo e exato no mesmo path não se misturam
    pub fn affinity_scope(&self) -> Cow<'_, str> {
        match self.path_match {
            PathMatch::Prefix => Cow::Borrowed(&self.path),
            PathMatch::Exact => Cow::Owned(format!("={}", self.path)),
        }
    }

    /// Pontua o match (maior = mais específico): exato > prefixo longo > prefixo curto
    fn score(&self, path: &str) -> Option<usize> {
        match self.path_match {
            PathMatch::Exact if path == self.path => Some(10_000 + self.path.len()),
            PathMatch::Prefix if prefix_matches(&self.path, path) => Some(1_000 + self.path.len()),
            _ => None,
        }
    }
}

/// Prefixo respeitando fronteira de segmento: /v3 casa /v3 e /v3/x, nunca /v30
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    path.len() == prefix.len() || prefix.ends_with('/') || path.as_bytes()[prefix.len()] == b'/'
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub backends: Vec<BackendSpec>,
    pub routes: Vec<RouteSpec>,
    #[serde(default, rename = "override")]
    pub overrides: OverrideResolver,
}

impl RoutingConfig {
    /// Topologia padrão: V1/V2 50/50 em `/`, `/v3` fixo em V3, MID=a -> V2, POST -> V1
    pub fn builtin() -> Self {
        Self {
            backends: ["V1", "V2", "V3"].into_iter().map(BackendSpec::local).collect(),
            routes: vec![
                RouteSpec {
                    path: "/".into(),
                    path_match: PathMatch::Prefix,
                    target: RouteTarget::Weighted(fifty_fifty()),
                    method_defaults: BTreeMap::from([("POST".into(), "V1".into())]),
                },
                RouteSpec {
                    path: "/v3".into(),
                    path_match: PathMatch::Prefix,
                    target: RouteTarget::Fixed("V3".into()),
                    method_defaults: BTreeMap::new(),
                },
            ],
            overrides: OverrideResolver {
                values: BTreeMap::from([("a".into(), "V2".into())]),
                ..OverrideResolver::default()
            },
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&raw)
    }

    /// Valida referências cruzadas; pesos já chegam validados pelo WeightTable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        let mut names = HashSet::new();
        for b in &self.backends {
            if !valid_backend_name(&b.name) {
                return Err(ConfigError::BadBackendName(b.name.clone()));
            }
            if !names.insert(b.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(b.name.clone()));
            }
        }
        let known = |context: &str, backend: &str| {
            if names.contains(backend) {
                Ok(())
            } else {
                Err(ConfigError::UnknownBackend {
                    context: context.into(),
                    backend: backend.into(),
                })
            }
        };

        let mut paths = HashSet::new();
        for r in &self.routes {
            if !r.path.starts_with('/') {
                return Err(ConfigError::BadPath(r.path.clone()));
            }
            if !paths.insert((r.path.as_str(), r.path_match)) {
                return Err(ConfigError::DuplicateRoute(r.path.clone()));
            }
            let context = format!("route {}", r.path);
            match &r.target {
                RouteTarget::Fixed(b) => known(&context, b)?,
                RouteTarget::Weighted(t) => {
                    for b in t.backends() {
                        known(&context, b)?;
                    }
                }
            }
            for (method, b) in &r.method_defaults {
                if Method::from_str(method).is_err() || method.to_ascii_uppercase() != *method {
                    return Err(ConfigError::BadMethod {
                        route: r.path.clone(),
                        method: method.clone(),
                    });
                }
                known(&context, b)?;
            }
        }

        let context = format!("override field {}", self.overrides.field);
        for b in self.overrides.values.values() {
            known(&context, b)?;
        }
        Ok(())
    }

    /// Rota mais específica para o path
    pub fn resolve(&self, path: &str) -> Option<&RouteSpec> {
        self.routes
            .iter()
            .filter_map(|r| r.score(path).map(|s| (s, r)))
            .max_by_key(|(s, _)| *s)
            .map(|(_, r)| r)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendSpec> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.backend(name).is_some()
    }

    /// Cópia da configuração com a tabela de pesos de `path` trocada
    /// Sem `path_match`, o path precisa identificar uma única rota
    pub fn with_weights(
        &self,
        path: &str,
        path_match: Option<PathMatch>,
        table: WeightTable,
    ) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        let mut candidates = next
            .routes
            .iter_mut()
            .filter(|r| r.path == path && path_match.is_none_or(|m| r.path_match == m));
        let route = candidates
            .next()
            .ok_or_else(|| ConfigError::UnknownRoute(path.into()))?;
        if candidates.next().is_some() {
            return Err(ConfigError::AmbiguousRoute(path.into()));
        }
        match &mut route.target {
            RouteTarget::Fixed(_) => return Err(ConfigError::FixedRoute(path.into())),
            RouteTarget::Weighted(t) => *t = table,
        }
        next.validate()?;
        Ok(next)
    }
}

fn fifty_fifty() -> WeightTable {
    WeightTable::new(vec![WeightEntry::new("V1", 50.0), WeightEntry::new("V2", 50.0)])
        .expect("builtin weights")
}

fn valid_backend_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'.'))
}

/// Snapshot de configuração versionado, trocado atomicamente
pub struct RouteTable {
    current: ArcSwap<RoutingConfig>,
    version: AtomicU64,
    /// Serializa escritores (admin/reload); leitores não passam por aqui
    writer: Mutex<()>,
}

impl RouteTable {
    pub fn new(cfg: RoutingConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(cfg),
            version: AtomicU64::new(1),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingConfig> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Troca a configuração inteira (reload); retorna a nova versão
    pub fn replace(&self, cfg: RoutingConfig) -> Result<u64, ConfigError> {
        cfg.validate()?;
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.current.store(Arc::new(cfg));
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(version = v, "routing config replaced");
        Ok(v)
    }

    /// Passo de rollout gradual: troca só os pesos de uma rota
    pub fn update_weights(
        &self,
        path: &str,
        path_match: Option<PathMatch>,
        entries: Vec<WeightEntry>,
    ) -> Result<u64, ConfigError> {
        let table = WeightTable::new(entries)?;
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let next = self.current.load().with_weights(path, path_match, table)?;
        self.current.store(Arc::new(next));
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(version = v, route = path, "route weights updated");
        Ok(v)
    }
}
