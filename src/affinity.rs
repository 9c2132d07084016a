/// Store de afinidade de sessão (sticky sessions)
/// Mapeia (token de sessão, rota) -> backend atribuído, com TTL de ociosidade
/// Usa DashMap (sharded) para não virar gargalo com muitos clientes concorrentes
use std::{
    collections::{HashMap, hash_map},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Fonte de tempo injetável (relógio sintético nos testes de TTL)
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Relógio manual: só avança quando mandado
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::Relaxed))
    }
}

/// Token opaco de sessão (UUID v4 em hex simples)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Aceita apenas tokens bem formados; qualquer outra coisa é descartada
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::try_parse(raw.trim())
            .ok()
            .map(|u| Self(u.simple().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registro de afinidade: backend fixo enquanto o registro estiver vivo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityRecord {
    pub backend: String,
    pub created_at: Instant,
    pub last_seen: Instant,
}

impl AffinityRecord {
    fn new(backend: &str, now: Instant) -> Self {
        Self {
            backend: backend.to_owned(),
            created_at: now,
            last_seen: now,
        }
    }
}

/// Vínculos de uma sessão, um por rota (escopo)
/// Cada rota ponderada sorteia e fixa o seu próprio backend
#[derive(Debug, Default)]
struct Session {
    bindings: HashMap<String, AffinityRecord>,
}

pub struct AffinityStore {
    map: DashMap<SessionToken, Session>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl AffinityStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expired(&self, rec: &AffinityRecord, now: Instant) -> bool {
        now.saturating_duration_since(rec.last_seen) >= self.ttl
    }

    /// Sessão sem vínculos sai do mapa; só remove se continuar vazia sob o lock
    fn drop_if_empty(&self, token: &SessionToken) {
        self.map.remove_if(token, |_, s| s.bindings.is_empty());
    }

    /// Busca o vínculo do token na rota `scope`, renovando o last_seen
    /// Vínculos expirados são removidos aqui mesmo (lazy) e tratados como ausentes
    pub fn get(&self, scope: &str, token: &SessionToken) -> Option<AffinityRecord> {
        let now = self.clock.now();
        {
            let mut session = self.map.get_mut(token)?;
            let live = match session.bindings.get_mut(scope) {
                None => return None,
                Some(rec) if !self.expired(rec, now) => {
                    rec.last_seen = now;
                    Some(rec.clone())
                }
                Some(_) => None,
            };
            if live.is_some() {
                return live;
            }
            session.bindings.remove(scope);
        }
        self.drop_if_empty(token);
        None
    }

    /// Get-or-create linearizável por (token, rota)
    /// Corridas no mesmo token disputam o lock do shard: exatamente um backend vence
    /// e todos observam o mesmo registro. Retorna `true` se este chamador criou.
    pub fn get_or_insert(&self, scope: &str, token: SessionToken, backend: &str) -> (AffinityRecord, bool) {
        let now = self.clock.now();
        let mut session = self.map.entry(token).or_default();
        match session.bindings.entry(scope.to_owned()) {
            hash_map::Entry::Occupied(mut e) => {
                if self.expired(e.get(), now) {
                    e.insert(AffinityRecord::new(backend, now));
                    (e.get().clone(), true)
                } else {
                    e.get_mut().last_seen = now;
                    (e.get().clone(), false)
                }
            }
            hash_map::Entry::Vacant(v) => (v.insert(AffinityRecord::new(backend, now)).clone(), true),
        }
    }

    /// Vincula um backend ao token (gerado se não informado) e devolve o token
    /// Um token já vinculado na rota mantém o backend original
    pub fn put(&self, scope: &str, token: Option<SessionToken>, backend: &str) -> SessionToken {
        let token = token.unwrap_or_else(SessionToken::generate);
        self.get_or_insert(scope, token.clone(), backend);
        token
    }

    pub fn evict(&self, scope: &str, token: &SessionToken) -> Option<AffinityRecord> {
        let removed = self.map.get_mut(token)?.bindings.remove(scope);
        self.drop_if_empty(token);
        removed
    }

    /// Remove o vínculo só se ainda apontar para `backend`
    /// Quem perdeu a corrida não apaga o vínculo novo criado por outro request
    pub fn evict_stale(&self, scope: &str, token: &SessionToken, backend: &str) -> bool {
        let removed = match self.map.get_mut(token) {
            Some(mut session) => {
                let stale = session.bindings.get(scope).is_some_and(|r| r.backend == backend);
                if stale {
                    session.bindings.remove(scope);
                }
                stale
            }
            None => false,
        };
        self.drop_if_empty(token);
        removed
    }

    /// Token com pelo menos um vínculo vivo (emitido por este processo e ainda em uso)
    pub fn knows(&self, token: &SessionToken) -> bool {
        let now = self.clock.now();
        self.map
            .get(token)
            .is_some_and(|s| s.bindings.values().any(|r| !self.expired(r, now)))
    }

    /// Varredura de TTL; retorna quantos vínculos saíram
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.map.retain(|_, session| {
            session.bindings.retain(|_, rec| {
                let keep = !self.expired(rec, now);
                if !keep {
                    removed += 1;
                }
                keep
            });
            !session.bindings.is_empty()
        });
        metrics::gauge!("forklift_affinity_sessions").set(self.map.len() as f64);
        removed
    }

    /// Sessões (tokens) com algum vínculo
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Task de varredura periódica; roda fora do caminho de roteamento
pub fn spawn_sweeper(store: Arc<AffinityStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let removed = store.sweep();
            if removed > 0 {
                debug!(removed, live = store.len(), "affinity sweep");
            }
        }
    })
}
