use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::RequestBuilder;
use tokio_tungstenite::tungstenite::http::HeaderValue;

/// Credentials attached to every request towards Loki. Basic auth is the
/// only scheme the source speaks; anything richer belongs in the configured
/// headers.
#[derive(Debug, Clone)]
pub enum LokiAuth {
    None,
    Basic { username: String, password: String },
}

impl LokiAuth {
    pub fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => builder,
            Self::Basic { username, password } => builder.basic_auth(username, Some(password)),
        }
    }

    /// `Authorization` header value for the websocket upgrade request. The
    /// upgrade bypasses reqwest, so the header is stamped explicitly.
    pub fn authorization_header(&self) -> Option<HeaderValue> {
        match self {
            Self::None => None,
            Self::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                HeaderValue::from_str(&format!("Basic {encoded}")).ok()
            }
        }
    }
}
