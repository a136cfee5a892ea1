use crate::srv_conn::ServerRequestHandler;
use crate::tftp::{Packet, SocketError, TftpSocket};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Read deadline for one reply within a session.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive timeouts tolerated on a single block before a session gives up.
pub const DEFAULT_RETRIES: u32 = 10;

/// Listens on the well-known endpoint and fans each accepted request out to
/// an isolated per-client session on a fresh local endpoint.
pub struct Server {
    pub timeout: Duration,
    pub retries: u32,
    /// Directory that read requests are served from and write requests land in.
    pub root: PathBuf,
}

impl Default for Server {
    fn default() -> Server {
        Server {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            root: PathBuf::from("."),
        }
    }
}

impl Server {
    pub async fn listen_and_serve(&self, addr: SocketAddr) -> Result<(), SocketError> {
        let sock = TftpSocket::bind(addr)?;
        log::info!("Listening on {:?} ...", sock.local_addr()?);
        self.serve(sock).await
    }

    /// Accepts requests one datagram at a time. Malformed requests are logged
    /// and dropped; the loop ends only on an error reading from the socket.
    pub async fn serve(&self, sock: TftpSocket) -> Result<(), SocketError> {
        loop {
            let (buf, src) = sock.recv_raw_from().await?;

            let request = match Packet::parse_request(&buf) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Invalid request from {:?}: {}", src, e);
                    continue;
                }
            };

            log::info!("[{:?}] accepted request: {:?}", src, request);
            let root = self.root.clone();
            let timeout = self.timeout;
            let retries = self.retries;
            tokio::spawn(async move {
                match ServerRequestHandler::new(&root, &request, src).await {
                    Ok(handler) => handler.handle(timeout, retries).await,
                    Err(e) => log::warn!("[{:?}] request rejected: {}", src, e),
                }
            });
        }
    }
}
