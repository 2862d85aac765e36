use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::relaytun::tunnel::protocol::MAX_FRAME_BYTES;
use crate::relaytun::tunnel::transport::{BoxedLink, DialRequest, LinkError, RelayDialer, RelayLink};

/// Plain TCP relay link for self-hosted relays; frame boundaries come from the codec.
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

#[async_trait]
impl RelayDialer for TcpDialer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, _req: &DialRequest) -> Result<BoxedLink, LinkError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|err| LinkError::Unreachable(format!("{}: {err}", self.addr)))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(TcpLink {
            stream,
            buf: vec![0u8; MAX_FRAME_BYTES],
        }))
    }
}

struct TcpLink {
    stream: TcpStream,
    buf: Vec<u8>,
}

#[async_trait]
impl RelayLink for TcpLink {
    async fn send(&mut self, msg: Bytes) -> Result<(), LinkError> {
        self.stream
            .write_all(&msg)
            .await
            .map_err(|err| LinkError::Io(err.to_string()))
    }

    async fn recv(&mut self) -> Result<Bytes, LinkError> {
        let n = self
            .stream
            .read(&mut self.buf)
            .await
            .map_err(|err| LinkError::Io(err.to_string()))?;
        if n == 0 {
            return Err(LinkError::Closed {
                code: None,
                reason: "eof".into(),
            });
        }
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    async fn ping(&mut self) -> Result<(), LinkError> {
        // No transport-level ping; pending acks keep the stream warm.
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
