use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest datagram the protocol produces: 4-byte header plus one full block.
pub const DATAGRAM_SIZE: usize = 516;
/// Payload bytes carried by a full DATA packet. A shorter payload marks the
/// final block of a transfer.
pub const BLOCK_SIZE: usize = 512;

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }

    /// Wire encoding used for the string fields of requests and errors
    /// exchanged in this mode. DATA payloads are never translated.
    pub fn wire_encoding(&self) -> WireEncoding {
        match self {
            FileMode::NetAscii => WireEncoding::Netascii,
            FileMode::Octet => WireEncoding::Binary,
        }
    }
}

impl FromStr for FileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            other => Err(format!("Unknown file mode: '{other}'")),
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// How the string fields of requests and errors are translated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEncoding {
    Binary,
    Netascii,
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// Whether the payload is gzipped end-to-end.
        compress: bool,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        compress: bool,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

///////////////////////////////////////////////////////////////
// Netascii translation

/// Translates text to its wire form: `\n` becomes CR LF and `\r` becomes
/// CR NUL. Every other byte passes through.
pub fn netascii_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &b in input {
        match b {
            LF => out.extend_from_slice(&[CR, LF]),
            CR => out.extend_from_slice(&[CR, 0]),
            other => out.push(other),
        }
    }
    out
}

/// Reverses `netascii_encode`. A CR must be followed by LF or NUL; anything
/// else, including a CR ending the input, is a malformed sequence.
pub fn netascii_decode(input: &[u8]) -> TftpResult<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == CR {
            match input.get(i + 1) {
                Some(&LF) => out.push(LF),
                Some(&0) => out.push(CR),
                Some(&other) => {
                    return Err(SocketError::PacketParse(format!(
                        "Invalid netascii sequence: 0x{other:02X} after CR"
                    )))
                }
                None => {
                    return Err(SocketError::PacketParse(
                        "Lone CR at end of netascii input".to_string(),
                    ))
                }
            }
            i += 2;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    Ok(out)
}

///////////////////////////////////////////////////////////////
// Decoding

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the field begins at the beginning of the buffer
/// and extends until the first 0 byte.
///
/// Returns the raw field bytes as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was
/// encountered).
fn field_from_buffer(buf: &[u8]) -> (&[u8], usize) {
    match buf.iter().position(|&b| b == 0) {
        Some(i) => (&buf[..i], i),
        None => (buf, buf.len()),
    }
}

fn decode_field(raw: &[u8], enc: WireEncoding) -> TftpResult<String> {
    let bytes = match enc {
        WireEncoding::Netascii => netascii_decode(raw)?,
        WireEncoding::Binary => raw.to_vec(),
    };
    String::from_utf8(bytes)
        .map_err(|_| SocketError::PacketParse("Field is not valid UTF-8".to_string()))
}

/// Utility function for obtaining the TFTP OpCode from a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!(
            "Unknown opcode retrieved: {rawcode}"
        ))),
    }
}

fn parse_compress_flag(b: u8) -> TftpResult<bool> {
    match b {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(SocketError::PacketParse(format!(
            "Invalid compress flag: {other}"
        ))),
    }
}

fn parse_path_and_mode(buf: &[u8], enc: WireEncoding) -> TftpResult<(String, FileMode)> {
    let (raw_path, path_end) = field_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse(
            "Request does not contain a mode, but it needs to!".to_string(),
        ));
    }

    let path = decode_field(raw_path, enc)?;
    if path.is_empty() {
        return Err(SocketError::PacketParse(
            "Filename must not be empty!".to_string(),
        ));
    }

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = field_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(SocketError::PacketParse(
            "Mode must be terminated with a null byte!".to_string(),
        ));
    }

    let mode = decode_field(raw_mode, enc)?
        .parse::<FileMode>()
        .map_err(SocketError::PacketParse)?;

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8], enc: WireEncoding) -> TftpResult<Packet> {
    let compress = parse_compress_flag(buf[2])?;
    let (path, mode) = parse_path_and_mode(&buf[3..], enc)?;
    Ok(Packet::ReadReq {
        path,
        mode,
        compress,
    })
}

fn parse_write_req(buf: &[u8], enc: WireEncoding) -> TftpResult<Packet> {
    let compress = parse_compress_flag(buf[2])?;
    let (path, mode) = parse_path_and_mode(&buf[3..], enc)?;
    Ok(Packet::WriteReq {
        path,
        mode,
        compress,
    })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() > DATAGRAM_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Data packet of {} bytes exceeds the datagram limit",
            buf.len()
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data {
        block,
        data: Vec::from(&buf[4..]),
    })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != 4 {
        return Err(SocketError::PacketParse(format!(
            "Ack packet must be exactly 4 bytes, got {}",
            buf.len()
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8], enc: WireEncoding) -> TftpResult<Packet> {
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));

    let rest = &buf[4..];
    let (raw_message, message_end) = field_from_buffer(rest);

    if message_end == rest.len() {
        return Err(SocketError::PacketParse(
            "Error message must be terminated with a null byte!".to_string(),
        ));
    }

    let message = decode_field(raw_message, enc)?;
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8], enc: WireEncoding) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf, enc),
            OpCode::Wrq => parse_write_req(buf, enc),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf, enc),
        }
    }

    /// Decodes an initial request datagram, accepting either wire encoding.
    /// Binary framing is tried first; the opcode settles read vs write.
    pub fn parse_request(buf: &[u8]) -> TftpResult<Packet> {
        if let Ok(p @ (Packet::ReadReq { .. } | Packet::WriteReq { .. })) =
            Packet::parse_from_buf(buf, WireEncoding::Binary)
        {
            return Ok(p);
        }

        match Packet::parse_from_buf(buf, WireEncoding::Netascii)? {
            p @ (Packet::ReadReq { .. } | Packet::WriteReq { .. }) => Ok(p),
            other => Err(SocketError::PacketParse(format!(
                "Expected a request packet, but got {:?} instead",
                other
            ))),
        }
    }

    /// Serializes the packet for the wire. The string fields of requests and
    /// errors are translated when `enc` is netascii; DATA payloads never are.
    pub fn encode(&self, enc: WireEncoding) -> Vec<u8> {
        match self {
            Packet::ReadReq {
                path,
                mode,
                compress,
            } => encode_request(OpCode::Rrq, path, *mode, *compress, enc),
            Packet::WriteReq {
                path,
                mode,
                compress,
            } => encode_request(OpCode::Wrq, path, *mode, *compress, enc),
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&(OpCode::Data as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&(OpCode::Ack as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&(OpCode::Error as u16).to_be_bytes());
                buf.extend_from_slice(&code.to_u16().to_be_bytes());
                encode_field(message, enc, &mut buf);
                buf
            }
        }
    }
}

fn encode_field(s: &str, enc: WireEncoding, buf: &mut Vec<u8>) {
    match enc {
        WireEncoding::Netascii => buf.extend_from_slice(&netascii_encode(s.as_bytes())),
        WireEncoding::Binary => buf.extend_from_slice(s.as_bytes()),
    }
    buf.push(0);
}

fn encode_request(
    op: OpCode,
    path: &str,
    mode: FileMode,
    compress: bool,
    enc: WireEncoding,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + path.len() + mode.as_str().len() + 2);
    buf.extend_from_slice(&(op as u16).to_be_bytes());
    buf.push(compress as u8);
    encode_field(path, enc, &mut buf);
    encode_field(mode.as_str(), enc, &mut buf);
    buf
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that frames datagrams for the rest of the
/// crate. Receives are deadline-armed; decoding stays with the caller so a
/// datagram's source address can be checked before it is parsed.
#[derive(Debug)]
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(
        &self,
        packet: &Packet,
        enc: WireEncoding,
        dst: SocketAddr,
    ) -> TftpResult<()> {
        self.send_raw(&packet.encode(enc), dst).await
    }

    pub async fn send_raw(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }

    /// Blocks until a datagram arrives. Used by the listener, which has no
    /// read deadline of its own.
    pub async fn recv_raw_from(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; 1024];
        let (n, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..n].to_vec(), src))
    }

    pub async fn recv_from_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; 1024];
        let (n, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Ok((buf[..n].to_vec(), src))
    }
}
