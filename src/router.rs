/// Decisão de roteamento por requisição
/// Precedência estrita:
///   1. rota fixa (ex.: /v3 -> V3)
///   2. override explícito (MID=a -> V2)
///   3. default por método da rota (ex.: POST -> V1)
///   4. afinidade de sessão viva na rota (descartada se o backend saiu da tabela)
///   5. sorteio ponderado + get-or-create da afinidade
use std::sync::Arc;

use http::Method;
use tracing::{debug, error, info};

use crate::{
    affinity::{AffinityStore, SessionToken},
    error::RouteError,
    overrides::OverridePersistence,
    routes::{RouteTable, RouteTarget},
    weights::RandomSource,
};

/// Visão mínima da requisição que o roteador precisa
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub path: &'a str,
    pub method: &'a Method,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
    pub token: Option<SessionToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    FixedRoute,
    Override,
    MethodDefault,
    Affinity,
    Weighted,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FixedRoute => "fixed_route",
            Self::Override => "override",
            Self::MethodDefault => "method_default",
            Self::Affinity => "affinity",
            Self::Weighted => "weighted",
        }
    }
}

/// Resultado do roteamento: backend escolhido e token a devolver ao cliente
/// `issued` indica que o registro de afinidade foi criado agora (setar cookie)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub backend: String,
    pub token: Option<SessionToken>,
    pub issued: bool,
    pub reason: DecisionReason,
}

pub struct Router {
    routes: Arc<RouteTable>,
    affinity: Arc<AffinityStore>,
    rng: Arc<dyn RandomSource>,
    /// Token bem formado que o store não conhece é adotado (padrão) ou trocado
    adopt_unknown_tokens: bool,
}

impl Router {
    pub fn new(routes: Arc<RouteTable>, affinity: Arc<AffinityStore>, rng: Arc<dyn RandomSource>) -> Self {
        Self {
            routes,
            affinity,
            rng,
            adopt_unknown_tokens: true,
        }
    }

    pub fn adopt_unknown_tokens(mut self, adopt: bool) -> Self {
        self.adopt_unknown_tokens = adopt;
        self
    }

    pub fn affinity(&self) -> &AffinityStore {
        &self.affinity
    }

    /// Token usado para criar um vínculo novo
    /// Sem adoção, só tokens com vínculo vivo neste processo são mantidos
    fn binding_token(&self, presented: Option<SessionToken>) -> SessionToken {
        match presented {
            Some(t) if self.adopt_unknown_tokens || self.affinity.knows(&t) => t,
            _ => SessionToken::generate(),
        }
    }

    pub fn route(&self, req: RouteRequest<'_>) -> Result<Decision, RouteError> {
        // um único snapshot para a decisão inteira
        let cfg = self.routes.snapshot();
        let route = cfg
            .resolve(req.path)
            .ok_or_else(|| RouteError::NoRoute(req.path.into()))?;

        // ========== 1. ROTA FIXA ==========
        let table = match &route.target {
            RouteTarget::Fixed(backend) => {
                return Ok(record(Decision {
                    backend: backend.clone(),
                    token: req.token,
                    issued: false,
                    reason: DecisionReason::FixedRoute,
                }));
            }
            RouteTarget::Weighted(table) => table,
        };
        let scope = route.affinity_scope();
        let selectable = |backend: &str| cfg.has_backend(backend) && table.backends().any(|b| b == backend);

        // ========== 2. OVERRIDE ==========
        let forced = cfg
            .overrides
            .extract(req.method, req.content_type, req.body)
            .filter(|b| cfg.has_backend(b));
        if let Some(backend) = forced {
            let decision = match cfg.overrides.persistence {
                // só vincula backends que a própria rota pode servir
                OverridePersistence::BindIfUnbound if selectable(backend) => {
                    let token = self.binding_token(req.token);
                    let (_, issued) = self.affinity.get_or_insert(&scope, token.clone(), backend);
                    Decision {
                        backend: backend.into(),
                        token: Some(token),
                        issued,
                        reason: DecisionReason::Override,
                    }
                }
                OverridePersistence::RequestScoped | OverridePersistence::BindIfUnbound => Decision {
                    backend: backend.into(),
                    token: req.token,
                    issued: false,
                    reason: DecisionReason::Override,
                },
            };
            return Ok(record(decision));
        }

        // ========== 3. DEFAULT POR MÉTODO ==========
        if let Some(backend) = route.method_defaults.get(req.method.as_str()) {
            return Ok(record(Decision {
                backend: backend.clone(),
                token: req.token,
                issued: false,
                reason: DecisionReason::MethodDefault,
            }));
        }

        // ========== 4. AFINIDADE ==========
        if let Some(token) = &req.token {
            if let Some(rec) = self.affinity.get(&scope, token) {
                if selectable(&rec.backend) {
                    return Ok(record(Decision {
                        backend: rec.backend,
                        token: req.token,
                        issued: false,
                        reason: DecisionReason::Affinity,
                    }));
                }
                // backend saiu da rota (reload/rollout): a sessão é re-sorteada
                if self.affinity.evict_stale(&scope, token, &rec.backend) {
                    info!(route = %route.path, backend = %rec.backend, "stale affinity dropped");
                    metrics::counter!("forklift_affinity_stale_total").increment(1);
                }
            }
        }

        // ========== 5. SORTEIO PONDERADO ==========
        let drawn = table.select(self.rng.as_ref()).ok_or_else(|| {
            error!(route = %route.path, "weight table has no selectable backend");
            RouteError::InvalidWeights(route.path.clone())
        })?;
        let token = self.binding_token(req.token);
        let (rec, issued) = self.affinity.get_or_insert(&scope, token.clone(), drawn);
        Ok(record(Decision {
            backend: rec.backend,
            token: Some(token),
            issued,
            // perdeu a corrida: outro request já vinculou este token
            reason: if issued {
                DecisionReason::Weighted
            } else {
                DecisionReason::Affinity
            },
        }))
    }
}

fn record(decision: Decision) -> Decision {
    debug!(
        backend = %decision.backend,
        reason = decision.reason.as_str(),
        issued = decision.issued,
        "routed"
    );
    metrics::counter!(
        "forklift_decisions_total",
        "backend" => decision.backend.clone(),
        "reason" => decision.reason.as_str()
    )
    .increment(1);
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        affinity::ManualClock,
        routes::RoutingConfig,
        weights::{SeededRandom, WeightEntry, WeightTable},
    };
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    const FORM: Option<&str> = Some("application/x-www-form-urlencoded");
    static GET: Method = Method::GET;
    static POST: Method = Method::POST;

    /// Sequência roteirizada de sorteios, repetida em ciclo
    struct Scripted {
        draws: Vec<f64>,
        next: AtomicUsize,
    }

    impl Scripted {
        fn new(draws: &[f64]) -> Self {
            Self {
                draws: draws.to_vec(),
                next: AtomicUsize::new(0),
            }
        }
    }

    impl RandomSource for Scripted {
        fn next_unit(&self) -> f64 {
            let i = self.next.fetch_add(1, Ordering::Relaxed);
            self.draws[i % self.draws.len()]
        }
    }

    struct Fixture {
        router: Router,
        routes: Arc<RouteTable>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(cfg: RoutingConfig, rng: Arc<dyn RandomSource>) -> Fixture {
        let routes = Arc::new(RouteTable::new(cfg));
        let clock = Arc::new(ManualClock::new());
        let affinity = Arc::new(AffinityStore::with_clock(Duration::from_secs(60), clock.clone()));
        Fixture {
            router: Router::new(routes.clone(), affinity, rng),
            routes,
            clock,
        }
    }

    fn two_weighted_routes() -> RoutingConfig {
        RoutingConfig::from_json(
            r#"{
                "backends": [{"name":"V1"},{"name":"V2"},{"name":"A"},{"name":"B"}],
                "routes": [
                    {"path":"/","target":{"weighted":[{"backend":"V1","percent":50},{"backend":"V2","percent":50}]}},
                    {"path":"/api","target":{"weighted":[{"backend":"A","percent":50},{"backend":"B","percent":50}]}}
                ],
                "override": {"values":{"a":"V2"},"persistence":"bind_if_unbound"}
            }"#,
        )
        .unwrap()
    }

    fn fixture(draws: &[f64]) -> Fixture {
        fixture_with(RoutingConfig::builtin(), Arc::new(Scripted::new(draws)))
    }

    fn get<'a>(path: &'a str, token: Option<SessionToken>) -> RouteRequest<'a> {
        RouteRequest {
            path,
            method: &GET,
            content_type: None,
            body: b"",
            token,
        }
    }

    fn post<'a>(body: &'a [u8], token: Option<SessionToken>) -> RouteRequest<'a> {
        RouteRequest {
            path: "/",
            method: &POST,
            content_type: FORM,
            body,
            token,
        }
    }

    #[test]
    fn first_get_draws_and_issues_token() {
        let f = fixture(&[0.7]);
        let d = f.router.route(get("/", None)).unwrap();
        assert_eq!(d.backend, "V2");
        assert_eq!(d.reason, DecisionReason::Weighted);
        assert!(d.issued);
        let token = d.token.unwrap();
        assert_eq!(f.router.affinity().get("/", &token).unwrap().backend, "V2");
    }

    #[test]
    fn sticky_for_a_thousand_requests() {
        // sorteios alternam; a sessão não pode re-sortear
        let f = fixture(&[0.1, 0.9]);
        let first = f.router.route(get("/", None)).unwrap();
        let token = first.token.clone().unwrap();
        for _ in 0..1000 {
            let d = f.router.route(get("/", Some(token.clone()))).unwrap();
            assert_eq!(d.backend, first.backend);
            assert_eq!(d.reason, DecisionReason::Affinity);
            assert!(!d.issued);
        }
    }

    #[test]
    fn override_wins_over_affinity_without_rebinding() {
        let f = fixture(&[0.1]);
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();

        let d = f.router.route(post(b"MID=a", Some(token.clone()))).unwrap();
        assert_eq!(d.backend, "V2");
        assert_eq!(d.reason, DecisionReason::Override);
        assert!(!d.issued);

        // override é request-scoped: a sessão continua em V1
        assert_eq!(f.router.route(get("/", Some(token))).unwrap().backend, "V1");
    }

    #[test]
    fn override_without_session_does_not_issue_token() {
        let f = fixture(&[0.1]);
        let d = f.router.route(post(b"MID=a", None)).unwrap();
        assert_eq!(d.backend, "V2");
        assert!(d.token.is_none());
        assert!(f.router.affinity().is_empty());
    }

    #[test]
    fn unknown_override_value_falls_through() {
        let f = fixture(&[0.9]);
        let d = f.router.route(post(b"MID=zzz", None)).unwrap();
        // POST sem override válido cai no default do método
        assert_eq!(d.backend, "V1");
        assert_eq!(d.reason, DecisionReason::MethodDefault);
    }

    #[test]
    fn post_without_override_uses_method_default_even_when_sticky() {
        let f = fixture(&[0.9]);
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();
        let d = f.router.route(post(b"", Some(token.clone()))).unwrap();
        assert_eq!(d.backend, "V1");
        assert_eq!(d.token, Some(token));
        assert!(!d.issued);
    }

    #[test]
    fn post_without_method_default_uses_affinity() {
        let mut cfg = RoutingConfig::builtin();
        cfg.routes[0].method_defaults.clear();
        let f = fixture_with(cfg, Arc::new(Scripted::new(&[0.9])));
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();
        let d = f.router.route(post(b"", Some(token))).unwrap();
        assert_eq!(d.backend, "V2");
        assert_eq!(d.reason, DecisionReason::Affinity);
    }

    #[test]
    fn fixed_route_ignores_cookie_and_override() {
        let f = fixture(&[0.1]);
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();
        let d = f.router.route(get("/v3", Some(token.clone()))).unwrap();
        assert_eq!(d.backend, "V3");
        assert_eq!(d.reason, DecisionReason::FixedRoute);
        assert_eq!(d.token, Some(token.clone()));

        let d = f
            .router
            .route(RouteRequest {
                path: "/v3",
                ..post(b"MID=a", Some(token))
            })
            .unwrap();
        assert_eq!(d.backend, "V3");
    }

    #[test]
    fn unknown_but_well_formed_token_is_adopted() {
        let f = fixture(&[0.9]);
        let token = SessionToken::generate();
        let d = f.router.route(get("/", Some(token.clone()))).unwrap();
        assert_eq!(d.token, Some(token));
        assert!(d.issued);
    }

    #[test]
    fn expired_session_is_redrawn() {
        let f = fixture(&[0.1, 0.9]);
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();
        f.clock.advance(Duration::from_secs(61));
        let d = f.router.route(get("/", Some(token))).unwrap();
        assert_eq!(d.backend, "V2");
        assert!(d.issued);
    }

    #[test]
    fn no_route_is_an_error() {
        let cfg = RoutingConfig::from_json(
            r#"{"backends":[{"name":"V1"}],"routes":[{"path":"/api","target":{"fixed":"V1"}}]}"#,
        )
        .unwrap();
        let f = fixture_with(cfg, Arc::new(Scripted::new(&[0.5])));
        assert_eq!(
            f.router.route(get("/other", None)),
            Err(RouteError::NoRoute("/other".into()))
        );
    }

    #[test]
    fn fifty_fifty_converges() {
        let f = fixture_with(RoutingConfig::builtin(), Arc::new(SeededRandom::new(2024)));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            let d = f.router.route(get("/", None)).unwrap();
            *counts.entry(d.backend).or_default() += 1;
        }
        let v2 = counts.get("V2").copied().unwrap_or(0) as f64 / 10.0;
        assert!((45.0..=55.0).contains(&v2), "V2 = {v2}%");
    }

    #[test]
    fn weight_update_applies_to_new_sessions_only() {
        let f = fixture_with(RoutingConfig::builtin(), Arc::new(SeededRandom::new(5)));
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();
        let bound = f.router.affinity().get("/", &token).unwrap().backend;

        f.routes
            .update_weights("/", None, vec![WeightEntry::new("V1", 0.0), WeightEntry::new("V2", 100.0)])
            .unwrap();

        for _ in 0..200 {
            assert_eq!(f.router.route(get("/", None)).unwrap().backend, "V2");
        }
        assert_eq!(f.router.route(get("/", Some(token))).unwrap().backend, bound);
    }

    #[test]
    fn bind_if_unbound_override_creates_affinity() {
        let mut cfg = RoutingConfig::builtin();
        cfg.overrides.persistence = OverridePersistence::BindIfUnbound;
        let f = fixture_with(cfg, Arc::new(Scripted::new(&[0.1])));

        let d = f.router.route(post(b"MID=a", None)).unwrap();
        assert!(d.issued);
        let token = d.token.unwrap();
        assert_eq!(f.router.route(get("/", Some(token))).unwrap().backend, "V2");

        // sessão já vinculada a V1 não é re-vinculada pelo override
        let bound = f.router.route(get("/", None)).unwrap().token.unwrap();
        let d = f.router.route(post(b"MID=a", Some(bound.clone()))).unwrap();
        assert_eq!(d.backend, "V2");
        assert!(!d.issued);
        assert_eq!(f.router.route(get("/", Some(bound))).unwrap().backend, "V1");
    }

    #[test]
    fn concurrent_first_requests_with_same_token_agree() {
        let f = fixture_with(RoutingConfig::builtin(), Arc::new(SeededRandom::new(11)));
        let token = SessionToken::generate();
        let seen = Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for _ in 0..16 {
                let (router, token, seen) = (&f.router, token.clone(), &seen);
                s.spawn(move || {
                    let d = router.route(get("/", Some(token))).unwrap();
                    seen.lock().unwrap().push(d.backend);
                });
            }
        });

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 16);
        assert!(seen.iter().all(|b| *b == seen[0]));
        assert_eq!(f.router.affinity().len(), 1);
    }

    #[test]
    fn session_on_removed_backend_is_redrawn_after_reload() {
        let f = fixture(&[0.1, 0.9]);
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();
        assert_eq!(f.router.affinity().get("/", &token).unwrap().backend, "V1");

        // V1 some da topologia
        let mut next = RoutingConfig::builtin();
        next.backends.retain(|b| b.name != "V1");
        next.routes[0].method_defaults.clear();
        next.routes[0].target = RouteTarget::Weighted(WeightTable::new(vec![WeightEntry::new("V2", 100.0)]).unwrap());
        f.routes.replace(next).unwrap();

        let d = f.router.route(get("/", Some(token.clone()))).unwrap();
        assert_eq!(d.backend, "V2");
        assert_eq!(d.reason, DecisionReason::Weighted);
        assert!(d.issued);
        assert_eq!(d.token, Some(token.clone()));

        // e o novo vínculo é estável
        let d = f.router.route(get("/", Some(token))).unwrap();
        assert_eq!(d.backend, "V2");
        assert_eq!(d.reason, DecisionReason::Affinity);
    }

    #[test]
    fn backend_dropped_from_route_table_is_redrawn() {
        let f = fixture(&[0.1, 0.9]);
        let token = f.router.route(get("/", None)).unwrap().token.unwrap();

        // V1 continua declarado, mas sai da tabela da rota
        f.routes
            .update_weights("/", None, vec![WeightEntry::new("V2", 100.0)])
            .unwrap();
        let d = f.router.route(get("/", Some(token))).unwrap();
        assert_eq!(d.backend, "V2");
        assert!(d.issued);
    }

    #[test]
    fn affinity_is_kept_per_route() {
        let f = fixture_with(two_weighted_routes(), Arc::new(Scripted::new(&[0.9, 0.1])));
        let d = f.router.route(get("/", None)).unwrap();
        assert_eq!(d.backend, "V2");
        let token = d.token.unwrap();

        let d = f.router.route(get("/api", Some(token.clone()))).unwrap();
        assert_eq!(d.backend, "A");
        assert_eq!(d.reason, DecisionReason::Weighted);

        for _ in 0..50 {
            assert_eq!(f.router.route(get("/", Some(token.clone()))).unwrap().backend, "V2");
            assert_eq!(f.router.route(get("/api/x", Some(token.clone()))).unwrap().backend, "A");
        }
        assert_eq!(f.router.affinity().len(), 1);
    }

    #[test]
    fn bind_if_unbound_skips_routes_that_cannot_serve_the_override() {
        let f = fixture_with(two_weighted_routes(), Arc::new(Scripted::new(&[0.1])));
        let d = f
            .router
            .route(RouteRequest {
                path: "/api",
                ..post(b"MID=a", None)
            })
            .unwrap();
        assert_eq!(d.backend, "V2");
        assert_eq!(d.reason, DecisionReason::Override);
        assert!(!d.issued);
        assert!(d.token.is_none());
        assert!(f.router.affinity().is_empty());
    }

    #[test]
    fn unknown_token_is_replaced_when_adoption_is_off() {
        let routes = Arc::new(RouteTable::new(RoutingConfig::builtin()));
        let affinity = Arc::new(AffinityStore::new(Duration::from_secs(60)));
        let router = Router::new(routes, affinity, Arc::new(Scripted::new(&[0.1]))).adopt_unknown_tokens(false);

        let planted = SessionToken::generate();
        let d = router.route(get("/", Some(planted.clone()))).unwrap();
        assert!(d.issued);
        let issued = d.token.unwrap();
        assert_ne!(issued, planted);
        assert!(!router.affinity().knows(&planted));

        // token emitido pelo processo continua valendo
        let d = router.route(get("/", Some(issued.clone()))).unwrap();
        assert_eq!(d.token, Some(issued));
        assert_eq!(d.reason, DecisionReason::Affinity);
    }
}
