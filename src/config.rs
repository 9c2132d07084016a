/// Configurações do processo (porta, cookie, TTL de afinidade, timeouts)
/// Todas carregadas de variáveis de ambiente, com padrões para desenvolvimento
/// A topologia de rotas vive à parte, em ROUTES_FILE (ver `routes`)
use std::path::PathBuf;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Cfg {
    /// Porta HTTP onde o roteador escuta
    pub port: u16,

    /// JSON com backends/rotas/override; ausente = topologia embutida
    pub routes_file: Option<PathBuf>,

    /// Nome do cookie de sessão
    pub cookie_name: String,

    /// Marca o cookie como Secure (atrás de TLS)
    pub cookie_secure: bool,

    /// Header que expõe o backend escolhido
    pub backend_header: String,

    /// Tempo ocioso até a afinidade expirar (segundos)
    pub affinity_ttl_secs: u64,

    /// Intervalo da varredura de afinidades expiradas (segundos)
    pub affinity_sweep_secs: u64,

    /// Timeout de conexão com backends remotos (milissegundos)
    pub connect_timeout_ms: u64,

    /// Timeout total de requisições a backends remotos (milissegundos)
    pub request_timeout_ms: u64,

    /// Limite máximo de requisições concorrentes
    pub concurrency_limit: usize,

    /// Tamanho máximo de corpo aceito (bytes)
    pub max_body_bytes: usize,

    /// Adota token de sessão bem formado que o processo não emitiu
    /// (primeiras requisições concorrentes com o mesmo token); false = sempre reemite
    pub adopt_client_tokens: bool,

    /// Seed do sorteio; ausente = entropia do sistema
    pub rng_seed: Option<u64>,

    /// Token exigido pelos endpoints admin de escrita (opcional)
    pub admin_token: Option<String>,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            port: 8080,
            routes_file: None,
            cookie_name: "forklift_id".into(),
            cookie_secure: false,
            backend_header: "X-Selected-Backend".into(),
            affinity_ttl_secs: 1800,
            affinity_sweep_secs: 30,
            adopt_client_tokens: true,
            connect_timeout_ms: 250,
            request_timeout_ms: 5000,
            concurrency_limit: 1024,
            max_body_bytes: 1 << 20,
            rng_seed: None,
            admin_token: None,
        }
    }
}

impl Cfg {
    /// Carrega configurações de variáveis de ambiente
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        let cfg = Self {
            // ========== SERVIDOR ==========
            port: parsed("PORT")?.unwrap_or(d.port),
            routes_file: std::env::var_os("ROUTES_FILE").map(PathBuf::from),
            concurrency_limit: parsed("CONCURRENCY_LIMIT")?.unwrap_or(d.concurrency_limit),
            max_body_bytes: parsed("MAX_BODY_BYTES")?.unwrap_or(d.max_body_bytes),

            // ========== SESSÃO ==========
            cookie_name: std::env::var("COOKIE_NAME").unwrap_or(d.cookie_name),
            cookie_secure: parsed("COOKIE_SECURE")?.unwrap_or(d.cookie_secure),
            backend_header: std::env::var("BACKEND_HEADER").unwrap_or(d.backend_header),
            affinity_ttl_secs: parsed("AFFINITY_TTL_SECS")?.unwrap_or(d.affinity_ttl_secs),
            affinity_sweep_secs: parsed("AFFINITY_SWEEP_SECS")?.unwrap_or(d.affinity_sweep_secs),
            adopt_client_tokens: parsed("ADOPT_CLIENT_TOKENS")?.unwrap_or(d.adopt_client_tokens),

            // ========== UPSTREAMS ==========
            connect_timeout_ms: parsed("CONNECT_TIMEOUT_MS")?.unwrap_or(d.connect_timeout_ms),
            request_timeout_ms: parsed("REQUEST_TIMEOUT_MS")?.unwrap_or(d.request_timeout_ms),

            // ========== SORTEIO / ADMIN ==========
            rng_seed: parsed("RNG_SEED")?,
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
        };

        anyhow::ensure!(cfg.affinity_ttl_secs > 0, "AFFINITY_TTL_SECS must be positive");
        anyhow::ensure!(cfg.affinity_sweep_secs > 0, "AFFINITY_SWEEP_SECS must be positive");
        anyhow::ensure!(cfg.concurrency_limit > 0, "CONCURRENCY_LIMIT must be positive");
        Ok(cfg)
    }

    /// Cópia com valores sensíveis mascarados, para logging
    pub fn redacted(&self) -> Self {
        let mut c = self.clone();
        c.admin_token = c.admin_token.as_ref().map(|_| "***".into());
        c
    }
}

/// Variável ausente = None; presente e inválida = erro (não cai em padrão silencioso)
fn parsed<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        Err(_) => Ok(None),
    }
}
