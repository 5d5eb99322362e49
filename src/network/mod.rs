pub mod tcp_connection;

use crate::codec::frame::Frame;
use crate::network::tcp_connection::TcpConnection;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Network connection abstraction for reading/writing frames
///
/// Implementations handle the underlying transport and frame
/// marshaling/unmarshaling.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Read a frame from the connection
    ///
    /// Waits until a complete frame is received and decoded.
    ///
    /// # Returns
    /// - `Ok(Frame)` - Successfully received and decoded frame
    /// - `Err` - Connection error or frame parsing failure
    async fn read_frame(&mut self) -> crate::Result<Frame>;

    /// Write a frame to the connection
    ///
    /// # Returns
    /// - `Ok(())` - Frame sent successfully
    /// - `Err` - Connection error or encoding failure
    async fn write_frame(&mut self, frame: Frame) -> crate::Result<()>;

    /// Close the connection gracefully
    async fn close(&mut self);

    /// Get the peer's socket address
    fn peer_addr(&mut self) -> io::Result<SocketAddr>;
}

/// Open a TCP connection to the session core
pub async fn create_connection(
    server_addr: &str,
    connect_timeout: Duration,
) -> crate::Result<Box<dyn Connection>> {
    let connect_result = timeout(connect_timeout, TcpStream::connect(server_addr)).await;

    match connect_result {
        Ok(Ok(stream)) => Ok(Box::new(TcpConnection::new(stream))),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err("connection timeout".into()),
    }
}
