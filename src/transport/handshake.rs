//! WebTransport upgrade validation
//!
//! An extended CONNECT request becomes a session only when it targets the
//! `webtransport` protocol on [`WEBTRANSPORT_PATH`]. Anything else is
//! answered with 404 and the request stream is ended.

use std::collections::HashMap;

/// Path served by this endpoint
pub const WEBTRANSPORT_PATH: &str = "/webtransport";

/// Draft version advertised in the accept response
pub const WEBTRANSPORT_DRAFT: &str = "draft02";

/// Pseudo-headers relevant to the upgrade decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub protocol: Option<String>,
    pub path: String,
    pub authority: Option<String>,
}

impl UpgradeRequest {
    pub fn new(method: impl Into<String>, protocol: Option<&str>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            protocol: protocol.map(str::to_string),
            path: path.into(),
            authority: None,
        }
    }

    /// Build from a request header map carrying HTTP/3 pseudo-headers
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        Self {
            method: headers.get(":method").cloned().unwrap_or_default(),
            protocol: headers.get(":protocol").cloned(),
            path: headers.get(":path").cloned().unwrap_or_default(),
            authority: headers.get(":authority").cloned(),
        }
    }

    /// Whether this is a WebTransport CONNECT for our path
    pub fn is_acceptable(&self) -> bool {
        self.method == "CONNECT"
            && self.protocol.as_deref() == Some("webtransport")
            && self.path == WEBTRANSPORT_PATH
    }

    /// Decide the response for this request
    pub fn evaluate(&self) -> UpgradeResponse {
        if self.is_acceptable() {
            UpgradeResponse::accepted()
        } else {
            UpgradeResponse::not_found()
        }
    }
}

/// Response to an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// End the request stream after the headers
    pub end_stream: bool,
}

impl UpgradeResponse {
    pub fn accepted() -> Self {
        Self {
            status: 200,
            headers: vec![(
                "sec-webtransport-http3-draft".to_string(),
                WEBTRANSPORT_DRAFT.to_string(),
            )],
            end_stream: false,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: vec![],
            end_stream: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}
