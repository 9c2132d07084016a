/// Adaptador HTTP da sessão: lê o cookie de entrada e anota a resposta
/// com o backend escolhido (header) e o token emitido (Set-Cookie)
/// O cookie é de sessão (sem Max-Age): quem expira o vínculo é o TTL ocioso do
/// store, que o cliente renova a cada requisição
use http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{COOKIE, SET_COOKIE},
};
use tracing::warn;

use crate::{affinity::SessionToken, router::Decision};

#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub name: String,
    pub secure: bool,
}

impl CookieSettings {
    fn render(&self, token: &SessionToken) -> String {
        let mut c = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", self.name, token);
        if self.secure {
            c.push_str("; Secure");
        }
        c
    }
}

/// Token da sessão vindo do cookie; valores malformados são ignorados
pub fn session_token(headers: &HeaderMap, cookie_name: &str) -> Option<SessionToken> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| *name == cookie_name)
        .find_map(|(_, value)| SessionToken::parse(value.trim_matches('"')))
}

/// Aplica header do backend (sempre) e cookie (só quando o token foi emitido agora)
pub fn annotate(headers: &mut HeaderMap, backend_header: &HeaderName, decision: &Decision, cookie: &CookieSettings) {
    match HeaderValue::from_str(&decision.backend) {
        Ok(v) => {
            headers.insert(backend_header.clone(), v);
        }
        Err(e) => warn!(backend = %decision.backend, "backend name is not a header value: {e}"),
    }

    if !decision.issued {
        return;
    }
    if let Some(token) = &decision.token {
        match HeaderValue::from_str(&cookie.render(token)) {
            Ok(v) => {
                headers.append(SET_COOKIE, v);
            }
            Err(e) => warn!("session cookie rejected: {e}"),
        }
    }
}
