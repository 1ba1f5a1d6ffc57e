//! Remote address extraction that also works when the router is driven
//! without a socket, as in `oneshot` tests.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;

/// Peer address, or `None` when connect info isn't available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl fmt::Display for MaybeConnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("unknown"),
        }
    }
}

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeConnectInfo(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn test_missing_connect_info() {
        let (mut parts, _) = Request::builder().uri("/ws").body(()).unwrap().into_parts();
        let info = MaybeConnectInfo::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(info, MaybeConnectInfo(None));
        assert_eq!(info.to_string(), "unknown");
    }

    #[tokio::test]
    async fn test_present_connect_info() {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (mut parts, _) = Request::builder().uri("/ws").body(()).unwrap().into_parts();
        parts.extensions.insert(ConnectInfo(addr));
        let info = MaybeConnectInfo::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(info.to_string(), "127.0.0.1:40000");
    }
}
