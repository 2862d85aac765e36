use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header::AUTHORIZATION},
    },
};

use crate::relaytun::tunnel::transport::{BoxedLink, DialRequest, LinkError, RelayDialer, RelayLink};

/// Relay link over a WebSocket; one binary message carries one or more frames.
pub struct WsDialer {
    endpoint: String,
}

impl WsDialer {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let lower = endpoint.to_ascii_lowercase();
        if !lower.starts_with("ws://") && !lower.starts_with("wss://") {
            anyhow::bail!("tunnel: websocket endpoint must start with ws:// or wss:// (got {endpoint:?})");
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl RelayDialer for WsDialer {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn dial(&self, req: &DialRequest) -> Result<BoxedLink, LinkError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| LinkError::Unreachable(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", req.bearer_token))
            .map_err(|_| LinkError::Denied("bearer token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match connect_async(request).await {
            Ok((ws, _resp)) => Ok(Box::new(WsLink { ws })),
            Err(tungstenite::Error::Http(resp)) => {
                let status = resp.status();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    Err(LinkError::Denied(format!("relay returned http {status}")))
                } else {
                    Err(LinkError::Unreachable(format!("relay returned http {status}")))
                }
            }
            Err(err) => Err(LinkError::Unreachable(err.to_string())),
        }
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RelayLink for WsLink {
    async fn send(&mut self, msg: Bytes) -> Result<(), LinkError> {
        self.ws
            .send(Message::Binary(msg))
            .await
            .map_err(|err| LinkError::Io(err.to_string()))
    }

    async fn recv(&mut self) -> Result<Bytes, LinkError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(b))) => return Ok(b),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(LinkError::Io("unexpected text message".into()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code) as u32), (*f.reason).to_owned()),
                        None => (None, String::new()),
                    };
                    return Err(LinkError::Closed { code, reason });
                }
                Some(Err(err)) => return Err(LinkError::Io(err.to_string())),
                None => {
                    return Err(LinkError::Closed {
                        code: None,
                        reason: "websocket ended".into(),
                    });
                }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), LinkError> {
        self.ws
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(|err| LinkError::Io(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
