use axum::{
    extract::{ConnectInfo, FromRequestParts, Request},
    http::{header, request::Parts, Extensions, HeaderMap},
};
use service_core::middleware::client_ip;
use std::{convert::Infallible, net::SocketAddr};

use crate::services::ClientInfo;

const MAX_USER_AGENT_LEN: usize = 512;

/// Caller ip and user agent, recorded on sessions and audit entries.
pub struct ClientContext(pub ClientInfo);

impl ClientContext {
    fn resolve(headers: &HeaderMap, extensions: &Extensions) -> ClientInfo {
        let peer = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        ClientInfo {
            ip_address: client_ip(headers, peer).map(|ip| ip.to_string()),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect()),
        }
    }

    pub fn from_request(req: &Request) -> ClientInfo {
        Self::resolve(req.headers(), req.extensions())
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientContext(Self::resolve(&parts.headers, &parts.extensions)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_forwarded_ip_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        headers.insert(header::USER_AGENT, "curl/8.0".parse().unwrap());

        let info = ClientContext::resolve(&headers, &Extensions::new());
        assert_eq!(info.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(info.user_agent.as_deref(), Some("curl/8.0"));
    }

    #[test]
    fn test_missing_peer_yields_no_ip() {
        let info = ClientContext::resolve(&HeaderMap::new(), &Extensions::new());
        assert!(info.ip_address.is_none());
        assert!(info.user_agent.is_none());
    }
}
