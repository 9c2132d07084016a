/// Tabela de pesos e sorteio ponderado
/// Cada rota com split de tráfego carrega uma tabela (backend, percentual)
/// O sorteio particiona [0,1) em ordem de tabela e escolhe quem contém o valor sorteado
use std::sync::{Mutex, PoisonError};

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerância aceita na soma dos percentuais (100 ± 0.5)
pub const SUM_TOLERANCE: f64 = 0.5;

/// Fonte uniforme de aleatoriedade em [0,1)
/// Injetável para que testes possam fixar a sequência sorteada
pub trait RandomSource: Send + Sync {
    fn next_unit(&self) -> f64;
}

/// Fonte de produção: rng por thread do `rand`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_unit(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Fonte reprodutível a partir de uma seed (RNG_SEED)
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_unit(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random::<f64>()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WeightError {
    #[error("weight table is empty")]
    Empty,
    #[error("backend {backend} has invalid percent {percent}")]
    InvalidPercent { backend: String, percent: f64 },
    #[error("backend {0} appears more than once")]
    Duplicate(String),
    #[error("all weights are zero")]
    AllZero,
    #[error("weights sum to {0}, expected 100")]
    BadSum(f64),
}

/// Uma entrada da tabela: backend e seu percentual de tráfego
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub backend: String,
    pub percent: f64,
}

impl WeightEntry {
    pub fn new(backend: impl Into<String>, percent: f64) -> Self {
        Self {
            backend: backend.into(),
            percent,
        }
    }
}

/// Tabela validada com limites cumulativos pré-calculados
/// Imutável depois de construída; atualizações trocam o snapshot inteiro
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<WeightEntry>", into = "Vec<WeightEntry>")]
pub struct WeightTable {
    entries: Vec<WeightEntry>,
    /// Limite superior (exclusivo) de cada entrada em [0,1]
    bounds: Vec<f64>,
}

impl WeightTable {
    pub fn new(entries: Vec<WeightEntry>) -> Result<Self, WeightError> {
        if entries.is_empty() {
            return Err(WeightError::Empty);
        }

        let mut total = 0.0;
        for (i, e) in entries.iter().enumerate() {
            if !e.percent.is_finite() || e.percent < 0.0 {
                return Err(WeightError::InvalidPercent {
                    backend: e.backend.clone(),
                    percent: e.percent,
                });
            }
            if entries[..i].iter().any(|p| p.backend == e.backend) {
                return Err(WeightError::Duplicate(e.backend.clone()));
            }
            total += e.percent;
        }

        if total <= 0.0 {
            return Err(WeightError::AllZero);
        }
        if (total - 100.0).abs() > SUM_TOLERANCE {
            return Err(WeightError::BadSum(total));
        }

        // ========== PARTIÇÃO CUMULATIVA ==========
        // Normaliza pela soma real; a partir do último peso não-zero o limite é 1.0
        // para absorver arredondamento sem dar largura a zeros no final
        let last_live = entries
            .iter()
            .rposition(|e| e.percent > 0.0)
            .unwrap_or(entries.len() - 1);
        let mut acc = 0.0;
        let bounds = entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                acc += e.percent / total;
                if i >= last_live { 1.0 } else { acc }
            })
            .collect();

        Ok(Self { entries, bounds })
    }

    /// Sorteia um backend usando um valor uniforme da fonte
    /// Retorna `None` apenas se nenhuma entrada tiver largura
    pub fn select(&self, rng: &dyn RandomSource) -> Option<&str> {
        self.pick(rng.next_unit())
    }

    /// Resolve um valor já sorteado para o dono do intervalo que o contém
    pub fn pick(&self, draw: f64) -> Option<&str> {
        let u = if draw.is_nan() || draw < 0.0 {
            0.0
        } else if draw >= 1.0 {
            1.0 - f64::EPSILON
        } else {
            draw
        };
        let idx = self.bounds.partition_point(|&b| b <= u);
        self.entries
            .get(idx)
            .filter(|e| e.percent > 0.0)
            .map(|e| e.backend.as_str())
    }

    pub fn entries(&self) -> &[WeightEntry] {
        &self.entries
    }

    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.backend.as_str())
    }

    pub fn percent_of(&self, backend: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.backend == backend)
            .map(|e| e.percent)
    }
}

impl TryFrom<Vec<WeightEntry>> for WeightTable {
    type Error = WeightError;

    fn try_from(entries: Vec<WeightEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<WeightTable> for Vec<WeightEntry> {
    fn from(table: WeightTable) -> Self {
        table.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table(pairs: &[(&str, f64)]) -> WeightTable {
        WeightTable::new(pairs.iter().map(|(b, p)| WeightEntry::new(*b, *p)).collect()).unwrap()
    }

    #[test]
    fn rejects_invalid_tables() {
        assert_eq!(WeightTable::new(vec![]), Err(WeightError::Empty));
        assert_eq!(
            WeightTable::new(vec![WeightEntry::new("V1", 0.0), WeightEntry::new("V2", 0.0)]),
            Err(WeightError::AllZero)
        );
        assert_eq!(
            WeightTable::new(vec![WeightEntry::new("V1", 60.0), WeightEntry::new("V2", 60.0)]),
            Err(WeightError::BadSum(120.0))
        );
        assert!(matches!(
            WeightTable::new(vec![WeightEntry::new("V1", -1.0), WeightEntry::new("V2", 101.0)]),
            Err(WeightError::InvalidPercent { .. })
        ));
        assert!(matches!(
            WeightTable::new(vec![WeightEntry::new("V1", f64::NAN)]),
            Err(WeightError::InvalidPercent { .. })
        ));
        assert_eq!(
            WeightTable::new(vec![WeightEntry::new("V1", 50.0), WeightEntry::new("V1", 50.0)]),
            Err(WeightError::Duplicate("V1".into()))
        );
    }

    #[test]
    fn accepts_sum_within_tolerance() {
        let t = table(&[("V1", 33.3), ("V2", 33.3), ("V3", 33.3)]);
        assert_eq!(t.entries().len(), 3);
    }

    #[test]
    fn partition_boundaries_follow_table_order() {
        let t = table(&[("V1", 25.0), ("V2", 75.0)]);
        assert_eq!(t.pick(0.0), Some("V1"));
        assert_eq!(t.pick(0.2499), Some("V1"));
        assert_eq!(t.pick(0.25), Some("V2"));
        assert_eq!(t.pick(0.9999), Some("V2"));
    }

    #[test]
    fn out_of_range_draws_are_clamped() {
        let t = table(&[("V1", 50.0), ("V2", 50.0)]);
        assert_eq!(t.pick(-3.0), Some("V1"));
        assert_eq!(t.pick(f64::NAN), Some("V1"));
        assert_eq!(t.pick(1.0), Some("V2"));
        assert_eq!(t.pick(7.5), Some("V2"));
    }

    #[test]
    fn zero_weight_is_never_selected() {
        let t = table(&[("V0", 0.0), ("V1", 100.0), ("V2", 0.0)]);
        for i in 0..1000 {
            let u = i as f64 / 1000.0;
            assert_eq!(t.pick(u), Some("V1"));
        }
        assert_eq!(t.pick(0.999_999_999), Some("V1"));
    }

    #[test]
    fn full_rollout_sends_everything_to_new_version() {
        let t = table(&[("V1", 0.0), ("V2", 100.0)]);
        let rng = SeededRandom::new(7);
        assert!((0..500).all(|_| t.select(&rng) == Some("V2")));
    }

    #[test]
    fn seeded_draws_converge_to_configured_split() {
        let t = table(&[("V1", 50.0), ("V2", 50.0)]);
        let rng = SeededRandom::new(42);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..10_000 {
            *counts.entry(t.select(&rng).unwrap()).or_default() += 1;
        }
        let v2 = counts["V2"] as f64 / 10_000.0;
        assert!((0.47..=0.53).contains(&v2), "V2 share {v2}");
    }

    #[test]
    fn serde_round_trip_validates() {
        let t: WeightTable =
            serde_json::from_str(r#"[{"backend":"V1","percent":90},{"backend":"V2","percent":10}]"#)
                .unwrap();
        assert_eq!(t.percent_of("V2"), Some(10.0));
        assert!(serde_json::from_str::<WeightTable>("[]").is_err());
    }
}
