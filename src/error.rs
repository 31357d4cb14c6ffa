use thiserror::Error;

/// Bitget business code for "no position available to close" — the sell leg
/// landed before the long inventory settled.
pub const CODE_NO_POSITION: &str = "22002";
/// Bitget business code for a tradeSide/position-mode mismatch.
pub const CODE_SIDE_MISMATCH: &str = "40774";

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("network: {0}")]
    Transport(String),

    #[error("rate limited (429)")]
    RateLimited,

    #[error("auth rejected (http {0})")]
    Auth(u16),

    /// Non-success `{code, msg}` envelope from the exchange. The original
    /// code is preserved so retry classifiers can match on it.
    #[error("exchange code {code}: {msg}")]
    Business { code: String, msg: String },

    #[error("a strategy instance is already running")]
    AlreadyRunning,

    #[error("no strategy instance is running")]
    NotRunning,

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("config key `{0}` cannot be changed while the strategy is running")]
    ConfigImmutableKey(String),

    #[error("invalid grid range: {0}")]
    GridConfigInvalid(String),

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error("instrument spec not found: {0}")]
    SpecNotFound(String),

    #[error("persistence: {0}")]
    Persistence(String),
}

impl EngineError {
    /// The exchange business code, if this is a business-level rejection.
    /// Transport errors never expose a code, even when the payload carried
    /// one — only a parsed `{code, msg}` envelope counts.
    pub fn business_code(&self) -> Option<&str> {
        match self {
            EngineError::Business { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// True for the two codes that mean "position not settled yet / wrong
    /// tradeSide" — the only errors worth retrying a paired sell on.
    pub fn is_position_retryable(&self) -> bool {
        matches!(
            self.business_code(),
            Some(CODE_NO_POSITION) | Some(CODE_SIDE_MISMATCH)
        )
    }

    /// Auth failures are terminal for a running loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineError::Auth(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_retry_classifier() {
        let no_pos = EngineError::Business {
            code: "22002".into(),
            msg: "No position to close".into(),
        };
        let mismatch = EngineError::Business {
            code: "40774".into(),
            msg: "The order type is not supported in the current mode".into(),
        };
        let other = EngineError::Business {
            code: "40001".into(),
            msg: "param error".into(),
        };
        assert!(no_pos.is_position_retryable());
        assert!(mismatch.is_position_retryable());
        assert!(!other.is_position_retryable());
    }

    #[test]
    fn test_transport_never_carries_code() {
        // A network error that happens to mention 22002 must not be treated
        // as a position error.
        let e = EngineError::Transport("http 502: {\"code\":\"22002\"}".into());
        assert_eq!(e.business_code(), None);
        assert!(!e.is_position_retryable());
    }

    #[test]
    fn test_auth_is_terminal() {
        assert!(EngineError::Auth(401).is_terminal());
        assert!(!EngineError::RateLimited.is_terminal());
    }
}
