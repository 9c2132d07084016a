/// Resolução de override explícito de backend
/// Um campo de formulário (MID por padrão) no corpo de um POST força o backend
/// O corpo é apenas lido; os bytes originais seguem intactos para o upstream
use std::collections::BTreeMap;

use http::Method;
use serde::{Deserialize, Serialize};

/// Se o override também cria afinidade para a sessão
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverridePersistence {
    /// Vale só para a requisição atual
    #[default]
    RequestScoped,
    /// Cria o registro se a sessão ainda não tiver um; nunca re-vincula
    BindIfUnbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideResolver {
    /// Nome do campo no corpo url-encoded
    #[serde(default = "default_field")]
    pub field: String,
    /// Valor do campo -> nome do backend
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub persistence: OverridePersistence,
}

fn default_field() -> String {
    "MID".into()
}

impl Default for OverrideResolver {
    fn default() -> Self {
        Self {
            field: default_field(),
            values: BTreeMap::new(),
            persistence: OverridePersistence::default(),
        }
    }
}

impl OverrideResolver {
    /// Extrai o backend forçado, se houver
    /// Métodos não-POST, content-type diferente, corpo vazio/ilegível ou valor
    /// desconhecido resultam em `None` (cai para a próxima regra de precedência)
    pub fn extract(&self, method: &Method, content_type: Option<&str>, body: &[u8]) -> Option<&str> {
        if *method != Method::POST || body.is_empty() || !is_form(content_type) {
            return None;
        }
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body).ok()?;
        let (_, value) = pairs.into_iter().find(|(k, _)| *k == self.field)?;
        self.values.get(value.trim()).map(String::as_str)
    }
}

fn is_form(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => ct
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded")),
    }
}
