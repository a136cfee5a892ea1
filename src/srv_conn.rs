// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received. The server handles
// this by creating a ServerRequestHandler instance. The ServerRequestHandler works in
// roughly the following stages:
//
// 1. Bind a fresh local endpoint, giving the session its own transfer identifier, and check
//    whether the request can be serviced by interacting with the filesystem.
// 2. If the request can be serviced, enter a phase of work and wait cycles. The work cycles
//    primarily involve reading or writing file contents and sending packets, and the wait cycles
//    involve waiting for the client to respond to the output of the work cycles with packets of
//    its own. Each wait is bounded by a read deadline; a deadline that passes puts the previous
//    datagram back on the wire, up to a retry cap.
// 3. Eventually the request enters a terminal phase: the final short block is acknowledged, an
//    error packet is sent or received, or the retries run out. Failing exits delete a write
//    session's partial output file.
//
// Datagrams arriving from any address other than the session's pinned peer never touch session
// state; the spurious sender gets an "unknown transfer ID" error packet as a courtesy.

use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp;
use crate::tftp::{Packet, SocketError, TftpSocket, WireEncoding};
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io;
use tokio::time::Instant;

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive connections.
    sock: TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// Wire encoding for this session's requests and error messages.
    enc: WireEncoding,

    /// The packet processor.
    processor: PacketProcessor,
}

/// Attempts to bind to a random UDP socket until one succeeds.
pub fn bind_random_socket() -> TftpSocket {
    let mut rng = rand::thread_rng();
    let mut sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into());
    while !sock.is_ok() {
        log::warn!("Couldn't bind socket: {:#?}", sock);
        sock = TftpSocket::bind(
            (
                Ipv4Addr::UNSPECIFIED,
                rand::thread_rng().gen_range(1024..65535),
            )
                .into(),
        );
    }
    sock.unwrap()
}

async fn send_error_packet(
    sock: &TftpSocket,
    dst: SocketAddr,
    enc: WireEncoding,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, enc, dst).await;
}

/// Maps a requested filename into the served directory. Leading slashes are
/// stripped and upward traversal is refused.
fn resolve_path(prefix: &Path, requested: &str) -> Result<PathBuf, ServerConnectionError> {
    let trimmed = requested.trim_start_matches('/');
    if trimmed.split(['/', '\\']).any(|part| part == "..") {
        return Err(ServerConnectionError::BadRequest(format!(
            "Refusing path that traverses upwards: '{requested}'"
        )));
    }
    Ok(prefix.join(trimmed))
}

impl ServerRequestHandler {
    pub async fn new(
        path_prefix: &Path,
        initial_request: &Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        log::info!("Binding socket");
        let sock = bind_random_socket();
        match initial_request {
            Packet::ReadReq {
                path,
                mode,
                compress,
            } => {
                let enc = mode.wire_encoding();
                let open_path = match resolve_path(path_prefix, path) {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(
                            &sock,
                            src,
                            enc,
                            tftp::ErrorCode::AccessViolation,
                            "Access violation".to_string(),
                        )
                        .await;
                        return Err(e);
                    }
                };

                let processor = match PacketProcessor::new_for_reading(&open_path, *compress).await
                {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(&sock, src, enc, e.kind().into(), format!("{:?}", e))
                            .await;
                        return Err(e.into());
                    }
                };

                Ok(ServerRequestHandler {
                    sock,
                    dst: src,
                    enc,
                    processor,
                })
            }
            Packet::WriteReq {
                path,
                mode,
                compress,
            } => {
                let enc = mode.wire_encoding();
                let open_path = match resolve_path(path_prefix, path) {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(
                            &sock,
                            src,
                            enc,
                            tftp::ErrorCode::AccessViolation,
                            "Access violation".to_string(),
                        )
                        .await;
                        return Err(e);
                    }
                };

                let processor = match PacketProcessor::new_for_writing(&open_path, *compress).await
                {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(&sock, src, enc, e.kind().into(), format!("{:?}", e))
                            .await;
                        return Err(e.into());
                    }
                };

                Ok(ServerRequestHandler {
                    sock,
                    dst: src,
                    enc,
                    processor,
                })
            }
            _ => Err(ServerConnectionError::BadRequest(
                "Only read and write requests are valid initial requests.".to_string(),
            )),
        }
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(mut self, read_timeout: Duration, max_retries: u32) {
        let mut wire = match self.processor.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => p.encode(self.enc),
            ResultAction::SendRawAndAwait(raw) => raw,
            other => {
                log::error!(
                    "Packet processor produced {:?} before the first message was sent. This should never happen!",
                    other
                );
                send_error_packet(
                    &self.sock,
                    self.dst,
                    self.enc,
                    tftp::ErrorCode::Undefined,
                    "Internal error, please retry".to_string(),
                )
                .await;
                return;
            }
        };

        let mut retries = 0;
        // Each iteration puts |wire| on the wire: a fresh datagram after
        // progress, the same one again after a timeout or a stale reply.
        loop {
            if let Err(e) = self.sock.send_raw(&wire, self.dst).await {
                log::warn!("Unable to send packet: {e}");
                self.processor.abort().await;
                return;
            }

            let reply = match self.await_reply(read_timeout).await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Socket error on session with {:?}: {}", self.dst, e);
                    self.processor.abort().await;
                    return;
                }
            };

            let buf = match reply {
                Some(buf) => buf,
                None => {
                    retries += 1;
                    if retries >= max_retries {
                        log::warn!("Retries exhausted on session with {:?}, giving up", self.dst);
                        self.processor.abort().await;
                        return;
                    }
                    log::info!("Timed out, trying again");
                    continue;
                }
            };

            let packet = match Packet::parse_from_buf(&buf, self.enc) {
                Ok(p) => p,
                // If we couldn't parse the incoming packet, send an error and
                // kill the connection.
                Err(SocketError::PacketParse(msg)) => {
                    send_error_packet(
                        &self.sock,
                        self.dst,
                        self.enc,
                        tftp::ErrorCode::Illegal,
                        format!("Error parsing incoming packet: {msg}"),
                    )
                    .await;
                    self.processor.abort().await;
                    return;
                }
                Err(e) => {
                    log::warn!("Failed to read from {:?}: {}", self.dst, e);
                    self.processor.abort().await;
                    return;
                }
            };

            log::debug!("Got packet from {:?}: {:?}", self.dst, packet);
            match self.processor.process_packet(&packet).await {
                ResultAction::SendPacketAndAwait(p) => {
                    wire = p.encode(self.enc);
                    retries = 0;
                }
                ResultAction::SendRawAndAwait(raw) => {
                    wire = raw;
                    retries = 0;
                }
                ResultAction::ResendLast => {
                    // |wire| is untouched; the loop sends it again. A stale
                    // reply does not reset the retry counter.
                }
                ResultAction::CloseConnection(maybe_warn) => {
                    if let Some(msg) = maybe_warn {
                        log::warn!("{}", msg);
                        self.processor.abort().await;
                    }
                    log::info!("Closing connection with {:?}", self.dst);
                    return;
                }
                ResultAction::TerminateWithPacket(p) => {
                    let failed = matches!(p, Packet::Error { .. });
                    let _ = self.sock.send(&p, self.enc, self.dst).await;
                    if failed {
                        self.processor.abort().await;
                    }
                    log::info!("Closing connection with {:?}", self.dst);
                    return;
                }
            }
        }
    }

    /// Waits for a datagram from the pinned peer, discarding traffic from any
    /// other address. Returns None when the deadline passes.
    async fn await_reply(&self, read_timeout: Duration) -> Result<Option<Vec<u8>>, SocketError> {
        let deadline = Instant::now() + read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match self.sock.recv_from_with_timeout(remaining).await {
                Ok((buf, src)) => {
                    if src != self.dst {
                        log::warn!(
                            "Discarding datagram from {:?}; this session belongs to {:?}",
                            src,
                            self.dst
                        );
                        send_error_packet(
                            &self.sock,
                            src,
                            WireEncoding::Binary,
                            tftp::ErrorCode::UnknownTid,
                            "Unknown transfer ID".to_string(),
                        )
                        .await;
                        continue;
                    }
                    return Ok(Some(buf));
                }
                Err(SocketError::Timeout(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Internal(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {:#?}", msg),
            Self::File(e) => write!(f, "File IO error: {:#?}", e),
            Self::Internal(msg) => write!(f, "Internal error: {:#?}", msg),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_strips_leading_slash() {
        let resolved = resolve_path(Path::new("/srv"), "/greet").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/greet"));
    }

    #[test]
    fn test_resolve_path_refuses_traversal() {
        assert!(resolve_path(Path::new("/srv"), "../etc/passwd").is_err());
        assert!(resolve_path(Path::new("/srv"), "a/../../b").is_err());
    }
}
