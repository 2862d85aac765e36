use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::relaytun::tunnel::{
    error::TunnelError,
    protocol::{CloseCode, CloseDisposition, Frame, RelayCodec, encode_frame},
    target::Target,
    transport::{BoxedLink, DialRequest, LinkError, RelayDialer},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Data(Bytes),
    Ack(u64),
    Closed { code: CloseCode, reason: String },
}

/// Where a resumed session picks up.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub session_id: String,
    pub acked: u64,
    pub sent_total: u64,
    pub received: u64,
}

/// One relay link after a successful handshake. Never retries on its own.
pub struct RelayConnection {
    link: BoxedLink,
    rx: BytesMut,
    session_id: String,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("session_id", &self.session_id)
            .field("buffered", &self.rx.len())
            .finish_non_exhaustive()
    }
}

impl RelayConnection {
    /// Fresh handshake: opens a new relay session for `target`.
    pub async fn connect(
        dialer: &dyn RelayDialer,
        target: &Target,
        token: String,
        handshake_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let handshake = async {
            let mut link = dial(dialer, target, &token).await?;
            send(
                &mut link,
                Frame::ConnectRequest {
                    target: target.clone(),
                    token,
                },
            )
            .await?;

            let mut rx = BytesMut::new();
            match await_frame(&mut link, &mut rx, false).await? {
                Frame::ConnectSuccess { session_id } => Ok(Self {
                    link,
                    rx,
                    session_id,
                }),
                Frame::Close { code, reason } => Err(classify_close(code, reason, false)),
                other => Err(TunnelError::ProtocolViolation(format!(
                    "expected connect_success, got {}",
                    other.kind()
                ))),
            }
        };

        tokio::time::timeout(handshake_timeout, handshake)
            .await
            .map_err(|_| TunnelError::HandshakeTimeout(handshake_timeout))?
    }

    /// Resume handshake. Returns the connection and the relay's ack offset, from which
    /// unacknowledged data must be replayed.
    pub async fn resume(
        dialer: &dyn RelayDialer,
        target: &Target,
        token: String,
        at: &ResumePoint,
        handshake_timeout: Duration,
    ) -> Result<(Self, u64), TunnelError> {
        let handshake = async {
            let mut link = dial(dialer, target, &token).await?;
            send(
                &mut link,
                Frame::ReconnectRequest {
                    session_id: at.session_id.clone(),
                    ack_offset: at.acked,
                    bytes_received: at.received,
                },
            )
            .await?;

            let mut rx = BytesMut::new();
            match await_frame(&mut link, &mut rx, true).await? {
                Frame::ReconnectSuccess { ack_offset } => {
                    if ack_offset < at.acked || ack_offset > at.sent_total {
                        return Err(TunnelError::ProtocolViolation(format!(
                            "resume ack {ack_offset} outside [{}, {}]",
                            at.acked, at.sent_total
                        )));
                    }
                    Ok((
                        Self {
                            link,
                            rx,
                            session_id: at.session_id.clone(),
                        },
                        ack_offset,
                    ))
                }
                Frame::Close { code, reason } => Err(classify_close(code, reason, true)),
                other => Err(TunnelError::ProtocolViolation(format!(
                    "expected reconnect_success, got {}",
                    other.kind()
                ))),
            }
        };

        tokio::time::timeout(handshake_timeout, handshake)
            .await
            .map_err(|_| TunnelError::HandshakeTimeout(handshake_timeout))?
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send_data(&mut self, payload: Bytes) -> Result<(), TunnelError> {
        send(&mut self.link, Frame::Data(payload)).await
    }

    pub async fn send_ack(&mut self, bytes_received: u64) -> Result<(), TunnelError> {
        send(&mut self.link, Frame::Ack(bytes_received)).await
    }

    pub async fn ping(&mut self) -> Result<(), TunnelError> {
        self.link
            .ping()
            .await
            .map_err(|err| TunnelError::NetworkUnreachable(format!("relay link lost: {err}")))
    }

    /// Next inbound event. Cancel safe.
    pub async fn next_event(&mut self) -> Result<RelayEvent, TunnelError> {
        loop {
            if let Some(frame) = RelayCodec.decode(&mut self.rx)? {
                return match frame {
                    Frame::Data(b) => Ok(RelayEvent::Data(b)),
                    Frame::Ack(n) => Ok(RelayEvent::Ack(n)),
                    Frame::Close { code, reason } => Ok(RelayEvent::Closed { code, reason }),
                    other => Err(TunnelError::ProtocolViolation(format!(
                        "unexpected {} frame",
                        other.kind()
                    ))),
                };
            }

            match self.link.recv().await {
                Ok(b) => self.rx.extend_from_slice(&b),
                Err(LinkError::Closed {
                    code: Some(code),
                    reason,
                }) => {
                    return Ok(RelayEvent::Closed {
                        code: CloseCode(code),
                        reason,
                    });
                }
                Err(err) => {
                    return Err(TunnelError::NetworkUnreachable(format!(
                        "relay link lost: {err}"
                    )));
                }
            }
        }
    }

    pub async fn close(mut self) {
        self.link.close().await;
    }
}

async fn dial(
    dialer: &dyn RelayDialer,
    target: &Target,
    token: &str,
) -> Result<BoxedLink, TunnelError> {
    let req = DialRequest {
        bearer_token: token.to_string(),
        target: target.clone(),
    };
    dialer
        .dial(&req)
        .await
        .map_err(|err| classify_link(err, false))
}

async fn send(link: &mut BoxedLink, frame: Frame) -> Result<(), TunnelError> {
    let b = encode_frame(frame)?;
    link.send(b)
        .await
        .map_err(|err| TunnelError::NetworkUnreachable(format!("relay link lost: {err}")))
}

async fn await_frame(
    link: &mut BoxedLink,
    rx: &mut BytesMut,
    resuming: bool,
) -> Result<Frame, TunnelError> {
    loop {
        if let Some(frame) = RelayCodec.decode(rx)? {
            return Ok(frame);
        }
        match link.recv().await {
            Ok(b) => rx.extend_from_slice(&b),
            Err(err) => return Err(classify_link(err, resuming)),
        }
    }
}

fn classify_link(err: LinkError, resuming: bool) -> TunnelError {
    match err {
        LinkError::Denied(msg) => TunnelError::AuthorizationDenied(msg),
        LinkError::Closed {
            code: Some(code),
            reason,
        } => classify_close(CloseCode(code), reason, resuming),
        LinkError::Closed { code: None, reason } => {
            TunnelError::NetworkUnreachable(format!("relay closed during handshake: {reason}"))
        }
        LinkError::Unreachable(msg) | LinkError::Io(msg) => TunnelError::NetworkUnreachable(msg),
    }
}

fn classify_close(code: CloseCode, reason: String, resuming: bool) -> TunnelError {
    let detail = if reason.is_empty() {
        code.to_string()
    } else {
        format!("{code}: {reason}")
    };
    match code.disposition() {
        CloseDisposition::Denied => TunnelError::AuthorizationDenied(detail),
        CloseDisposition::SessionLost if resuming => TunnelError::SessionExpired,
        CloseDisposition::NotFound => TunnelError::TargetNotFound(detail),
        CloseDisposition::BackendUnreachable => {
            TunnelError::NetworkUnreachable(format!("relay could not reach backend: {detail}"))
        }
        _ => TunnelError::NetworkUnreachable(format!("relay closed: {detail}")),
    }
}
