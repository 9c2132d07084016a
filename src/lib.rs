//! forklift: roteador HTTP de rollout gradual/canário
//!
//! Escolhe, por requisição, qual versão de backend atende: rota fixa, override
//! explícito, default por método, afinidade de sessão ou sorteio ponderado.

pub mod affinity;
pub mod annotate;
pub mod app;
pub mod config;
pub mod error;
pub mod overrides;
pub mod router;
pub mod routes;
pub mod upstream;
pub mod weights;
