use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::relaytun::tunnel::target::Target;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The relay refused the upgrade (HTTP 401/403).
    #[error("denied: {0}")]
    Denied(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// Close signal from the relay; `code` is absent when the link just ended.
    #[error("closed ({code:?}): {reason}")]
    Closed { code: Option<u32>, reason: String },
    #[error("io: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct DialRequest {
    pub bearer_token: String,
    pub target: Target,
}

/// One message-oriented connection to the relay.
#[async_trait]
pub trait RelayLink: Send {
    async fn send(&mut self, msg: Bytes) -> Result<(), LinkError>;
    /// Must be cancel safe: dropping the future loses no received bytes.
    async fn recv(&mut self) -> Result<Bytes, LinkError>;
    async fn ping(&mut self) -> Result<(), LinkError>;
    async fn close(&mut self);
}

pub type BoxedLink = Box<dyn RelayLink>;

#[async_trait]
pub trait RelayDialer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dial(&self, req: &DialRequest) -> Result<BoxedLink, LinkError>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "websocket".into();
    }
    match n.as_str() {
        "websocket" | "ws" => Ok("websocket".into()),
        "tcp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected websocket|tcp)"),
    }
}

pub mod tcp;
pub mod ws;

pub fn dialer_by_name(name: &str, endpoint: &str) -> anyhow::Result<Arc<dyn RelayDialer>> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        anyhow::bail!("tunnel: relay endpoint is required");
    }
    let n = parse_transport(name)?;
    match n.as_str() {
        "websocket" => Ok(Arc::new(ws::WsDialer::new(endpoint)?)),
        "tcp" => Ok(Arc::new(tcp::TcpDialer::new(endpoint))),
        _ => unreachable!(),
    }
}
