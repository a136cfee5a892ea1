// Client side of the protocol. A transfer binds an ephemeral local endpoint,
// sends a single request to the server's well-known endpoint, and then plays
// the matching session role: receiver for a fetch, sender for a store. The
// first datagram coming back pins the peer endpoint; the server's fresh port
// is only ever learned from that source address.

use crate::compress::Compressor;
use crate::tftp::{ErrorCode, FileMode, Packet, SocketError, TftpSocket, WireEncoding, BLOCK_SIZE};
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Ceiling on a whole transfer, enforced regardless of session progress.
pub const OVERALL_DEADLINE: Duration = Duration::from_secs(10);
/// Read deadline for a single reply on the receiving side.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Send attempts per block on the writing side.
const MAX_RETRIES: u32 = 10;

#[derive(Debug)]
pub enum ClientError {
    TimedOut,
    Remote(ErrorCode, String),
    Protocol(String),
    Socket(SocketError),
    IO(io::Error),
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::TimedOut => write!(f, "Transfer timed out"),
            ClientError::Remote(code, msg) => write!(f, "Server error ({:?}): {}", code, msg),
            ClientError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::Socket(e) => write!(f, "{}", e),
            ClientError::IO(e) => write!(f, "IO error: {:#?}", e),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> ClientError {
        ClientError::IO(e)
    }
}

impl From<SocketError> for ClientError {
    fn from(e: SocketError) -> ClientError {
        match e {
            SocketError::Timeout(_) => ClientError::TimedOut,
            other => ClientError::Socket(other),
        }
    }
}

/// Knobs for a single transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub server: SocketAddr,
    pub mode: FileMode,
    pub compress: bool,
    /// Per-reply read deadline. The sending side uses a tenth of this per try.
    pub timeout: Duration,
    pub overall_deadline: Duration,
    /// Where fetched files are written.
    pub out_dir: PathBuf,
}

impl TransferOptions {
    pub fn new(server: SocketAddr) -> TransferOptions {
        TransferOptions {
            server,
            mode: FileMode::Octet,
            compress: false,
            timeout: DEFAULT_TIMEOUT,
            overall_deadline: OVERALL_DEADLINE,
            out_dir: PathBuf::from("."),
        }
    }
}

/// Derives the local output filename for a fetched payload, with path
/// separators flattened to underscores.
fn output_file_name(kind: &str, filename: &str) -> String {
    format!("received_{}{}", kind, filename).replace(['/', '\\'], "_")
}

async fn send_error_packet(
    sock: &TftpSocket,
    dst: SocketAddr,
    enc: WireEncoding,
    code: ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, enc, dst).await;
}

/// Fetches `filename` from the server and returns the path the payload was
/// written to.
pub async fn fetch(opts: &TransferOptions, filename: &str) -> Result<PathBuf, ClientError> {
    let sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
    let enc = opts.mode.wire_encoding();
    let request = Packet::ReadReq {
        path: filename.to_string(),
        mode: opts.mode,
        compress: opts.compress,
    };
    log::info!("Sending read request for '{}' to {:?}", filename, opts.server);
    sock.send(&request, enc, opts.server).await?;

    let out_path = opts.out_dir.join(output_file_name("read", filename));
    let session = ReadSession {
        sock,
        enc,
        compress: opts.compress,
        read_timeout: opts.timeout,
        out_path: out_path.clone(),
    };

    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        // The send never blocks; if the outer deadline already won the race
        // the result is simply dropped.
        let _ = tx.send(session.run().await);
    });

    match timeout(opts.overall_deadline, rx).await {
        Ok(Ok(result)) => result.map(|_| out_path),
        Ok(Err(_)) => Err(ClientError::Protocol(
            "Transfer task ended without a result".to_string(),
        )),
        Err(_) => {
            task.abort();
            let _ = task.await;
            let _ = tokio::fs::remove_file(&out_path).await;
            Err(ClientError::TimedOut)
        }
    }
}

/// Sends the file at `path` to the server under its final path component.
pub async fn store(opts: &TransferOptions, path: &Path) -> Result<(), ClientError> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ClientError::Protocol(format!("Invalid payload path {:?}", path)))?
        .to_string();

    let mut payload = tokio::fs::read(path).await?;
    if opts.compress {
        payload = Compressor::default().compress(&payload)?;
    }

    let sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())?;
    let enc = opts.mode.wire_encoding();
    let request = Packet::WriteReq {
        path: filename.clone(),
        mode: opts.mode,
        compress: opts.compress,
    };
    log::info!("Sending write request for '{}' to {:?}", filename, opts.server);
    sock.send(&request, enc, opts.server).await?;

    let session = WriteSession {
        sock,
        enc,
        payload,
        try_timeout: opts.timeout / 10,
        read_timeout: opts.timeout,
    };

    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let _ = tx.send(session.run().await);
    });

    match timeout(opts.overall_deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ClientError::Protocol(
            "Transfer task ended without a result".to_string(),
        )),
        Err(_) => {
            task.abort();
            let _ = task.await;
            Err(ClientError::TimedOut)
        }
    }
}

/// Receiver role: acks DATA blocks in sequence and stops after the first
/// short one.
struct ReadSession {
    sock: TftpSocket,
    enc: WireEncoding,
    compress: bool,
    read_timeout: Duration,
    out_path: PathBuf,
}

impl ReadSession {
    async fn run(self) -> Result<(), ClientError> {
        let file = File::create(&self.out_path).await?;
        log::info!("Output file created: {:?}", self.out_path);

        match self.receive(file).await {
            Ok(()) => {
                log::info!("File {:?} received successfully", self.out_path);
                Ok(())
            }
            Err(e) => {
                match tokio::fs::remove_file(&self.out_path).await {
                    Ok(()) => log::info!("Incomplete file {:?} deleted", self.out_path),
                    Err(remove_err) => log::warn!(
                        "Failed to delete incomplete file {:?}: {}",
                        self.out_path,
                        remove_err
                    ),
                }
                Err(e)
            }
        }
    }

    async fn receive(&self, mut file: File) -> Result<(), ClientError> {
        let mut peer: Option<SocketAddr> = None;
        let mut expected: u16 = 1;
        // Compressed transfers accumulate here and gunzip at the end.
        let mut body: Vec<u8> = Vec::new();

        loop {
            let (buf, src) = self.sock.recv_from_with_timeout(self.read_timeout).await?;

            // The first reply pins the peer endpoint for the rest of the
            // session.
            let pinned = *peer.get_or_insert_with(|| {
                log::info!("Server data address set to {:?}", src);
                src
            });
            if src != pinned {
                log::warn!("Received packet from unknown address {:?}", src);
                continue;
            }

            match Packet::parse_from_buf(&buf, self.enc) {
                Ok(Packet::Data { block, data }) => {
                    if block == expected {
                        if self.compress {
                            body.extend_from_slice(&data);
                        } else {
                            file.write_all(&data).await?;
                        }
                        self.sock.send(&Packet::Ack { block }, self.enc, pinned).await?;

                        if data.len() < BLOCK_SIZE {
                            if self.compress {
                                let raw = Compressor::default().decompress(&body)?;
                                file.write_all(&raw).await?;
                            }
                            file.flush().await?;
                            return Ok(());
                        }
                        expected = expected.wrapping_add(1);
                    } else if block == expected.wrapping_sub(1) {
                        // Retransmitted block, our ack got lost. Ack it
                        // again without writing.
                        log::warn!("Duplicate data block {}, acking again", block);
                        self.sock.send(&Packet::Ack { block }, self.enc, pinned).await?;
                    } else {
                        let message = format!(
                            "Data blocks must arrive in sequence. Received block {block}, \
                            expected block {expected}."
                        );
                        send_error_packet(
                            &self.sock,
                            pinned,
                            self.enc,
                            ErrorCode::Illegal,
                            message.clone(),
                        )
                        .await;
                        return Err(ClientError::Protocol(message));
                    }
                }
                Ok(Packet::Error { code, message }) => {
                    return Err(ClientError::Remote(code, message))
                }
                Ok(other) => {
                    log::warn!("Unexpected packet {:?}, ignoring", other);
                }
                Err(SocketError::PacketParse(msg)) => return Err(ClientError::Protocol(msg)),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Sender role: pushes DATA blocks one at a time, each guarded by a short
/// per-try deadline and a retry cap.
struct WriteSession {
    sock: TftpSocket,
    enc: WireEncoding,
    payload: Vec<u8>,
    try_timeout: Duration,
    read_timeout: Duration,
}

impl WriteSession {
    async fn run(self) -> Result<(), ClientError> {
        // The priming datagram from the server's fresh endpoint tells us
        // where the rest of the session lives. Anything but an error packet
        // opens the session.
        let (buf, peer) = self.sock.recv_from_with_timeout(self.read_timeout).await?;
        if let Ok(Packet::Error { code, message }) = Packet::parse_from_buf(&buf, self.enc) {
            return Err(ClientError::Remote(code, message));
        }
        log::info!("Server data address set to {:?}", peer);

        let mut block: u16 = 0;
        let mut cursor = 0usize;
        loop {
            block = block.wrapping_add(1);
            let end = usize::min(cursor + BLOCK_SIZE, self.payload.len());
            let chunk = &self.payload[cursor..end];
            cursor = end;

            let wire = Packet::Data {
                block,
                data: chunk.to_vec(),
            }
            .encode(self.enc);
            self.send_block(block, &wire, peer).await?;

            if chunk.len() < BLOCK_SIZE {
                log::info!("File sent");
                return Ok(());
            }
        }
    }

    async fn send_block(&self, block: u16, wire: &[u8], peer: SocketAddr) -> Result<(), ClientError> {
        for _attempt in 0..MAX_RETRIES {
            self.sock.send_raw(wire, peer).await?;

            let (buf, src) = match self.sock.recv_from_with_timeout(self.try_timeout).await {
                Ok(reply) => reply,
                Err(SocketError::Timeout(_)) => {
                    log::info!("Timeout waiting for ack of block {}, trying again", block);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if src != peer {
                log::warn!("Received packet from unknown address {:?}", src);
                continue;
            }

            match Packet::parse_from_buf(&buf, self.enc) {
                Ok(Packet::Ack { block: acked }) if acked == block => return Ok(()),
                Ok(Packet::Ack { block: acked }) => {
                    // Stale ack; refresh the send on the next attempt.
                    log::warn!(
                        "Unexpected ACK block number: got {}, expected {}",
                        acked,
                        block
                    );
                }
                Ok(Packet::Error { code, message }) => {
                    return Err(ClientError::Remote(code, message))
                }
                Ok(other) => {
                    let message = format!("Expected an Ack packet, but got {:?} instead", other);
                    send_error_packet(
                        &self.sock,
                        peer,
                        self.enc,
                        ErrorCode::Illegal,
                        message.clone(),
                    )
                    .await;
                    return Err(ClientError::Protocol(message));
                }
                Err(SocketError::PacketParse(msg)) => return Err(ClientError::Protocol(msg)),
                Err(e) => return Err(e.into()),
            }
        }

        log::warn!("Max retries reached for block {}", block);
        Err(ClientError::TimedOut)
    }
}
