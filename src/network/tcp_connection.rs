use crate::codec::frame::Frame;
use crate::codec::parser::Parser;
use crate::network::Connection;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Longer than the keepalive interval, so an idle but healthy core never trips it
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames over one TCP stream to or from the session core
pub struct TcpConnection {
    stream: TcpStream,
    /// bytes received but not yet decoded into a frame
    pending: BytesMut,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(4096),
        }
    }

    /// Pop the next whole frame off the receive buffer, if there is one
    fn next_buffered(&mut self) -> crate::Result<Option<Frame>> {
        match Parser::unmarshal(&self.pending) {
            Ok((frame, consumed)) => {
                self.pending.advance(consumed);
                Ok(Some(frame))
            }
            Err(e) if Parser::is_incomplete(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    /// Cancel safe: a partially received frame stays buffered for the next call
    async fn read_frame(&mut self) -> crate::Result<Frame> {
        loop {
            if let Some(frame) = self.next_buffered()? {
                return Ok(frame);
            }

            let received = match timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.pending)).await {
                Ok(received) => received?,
                Err(_) => return Err("core read timed out".into()),
            };
            if received == 0 {
                // a close in the middle of a frame is not a clean shutdown
                return if self.pending.is_empty() {
                    Err("EOF".into())
                } else {
                    Err("connection reset by peer".into())
                };
            }
        }
    }

    async fn write_frame(&mut self, frame: Frame) -> crate::Result<()> {
        let bytes = Parser::marshal(frame)?;

        let sent = timeout(WRITE_TIMEOUT, async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await
        })
        .await;

        match sent {
            Ok(result) => Ok(result?),
            Err(_) => Err("core write timed out".into()),
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn peer_addr(&mut self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}
