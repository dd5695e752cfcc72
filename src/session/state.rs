use serde::Serialize;

/// Signaling session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Upgrade accepted, waiting for an offer
    Handshaking,
    /// Offer received, answer in progress
    Negotiating,
    /// Answer sent, media flowing once the peer connects
    Active,
    /// Cleanup in progress
    Closing,
    /// Generator and peer released
    Closed,
}

impl SessionState {
    /// Whether the session still owns (or may create) media resources
    pub fn is_open(&self) -> bool {
        !matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}
