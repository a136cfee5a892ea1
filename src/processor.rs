use crate::compress::Compressor;
use crate::tftp;
use crate::tftp::BLOCK_SIZE;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt};

#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    pub async fn new_for_reading(path: &Path, compress: bool) -> Result<PacketProcessor, io::Error> {
        let mut payload = tokio::fs::read(path).await?;
        if compress {
            payload = Compressor::default().compress(&payload)?;
        }
        Ok(PacketProcessor::Read(ReadProcessor::new(payload)))
    }

    pub async fn new_for_writing(path: &Path, compress: bool) -> Result<PacketProcessor, io::Error> {
        log::info!("Writing to {:?}", path);
        let file = File::create_new(path).await?;
        Ok(PacketProcessor::Write(WriteProcessor::new(
            file,
            path.to_path_buf(),
            compress,
        )))
    }

    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            // Acking block 0 kicks out the DATA packet for block 1.
            PacketProcessor::Read(p) => p.process_ack(&tftp::Packet::Ack { block: 0 }).await,
            // A write session opens with the priming datagram; the peer
            // learns the fresh transfer identifier from its source address.
            PacketProcessor::Write(_) => ResultAction::SendRawAndAwait(vec![0]),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }

    /// Releases resources after a failed transfer. A write session deletes
    /// its partial output file.
    pub async fn abort(self) {
        if let PacketProcessor::Write(w) = self {
            let path = w.path.clone();
            drop(w);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::info!("Incomplete file {:?} deleted", path),
                Err(e) => log::warn!("Failed to delete incomplete file {:?}: {}", path, e),
            }
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should send the bytes as-is and await a response.
    SendRawAndAwait(Vec<u8>),

    /// Caller should put its previous datagram back on the wire and keep
    /// waiting.
    ResendLast,

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),
}

#[derive(Debug)]
pub struct ReadProcessor {
    payload: Vec<u8>,
    cursor: usize,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl ReadProcessor {
    fn new(payload: Vec<u8>) -> ReadProcessor {
        ReadProcessor {
            payload,
            cursor: 0,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    fn next_chunk(&mut self) -> Vec<u8> {
        let end = usize::min(self.cursor + BLOCK_SIZE, self.payload.len());
        let chunk = self.payload[self.cursor..end].to_vec();
        self.cursor = end;
        chunk
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } => {
                if block == self.curr_block {
                    if self.awaiting_final_ack {
                        return ResultAction::CloseConnection(None);
                    }
                    self.curr_block = self.curr_block.wrapping_add(1);
                    let data = self.next_chunk();
                    if data.len() < BLOCK_SIZE {
                        self.awaiting_final_ack = true;
                    }
                    ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                        block: self.curr_block,
                        data,
                    })
                } else {
                    // Reordered or duplicated ack; the current block goes
                    // back on the wire.
                    log::warn!(
                        "Unexpected ACK block number: got {}, expected {}",
                        block,
                        self.curr_block
                    );
                    ResultAction::ResendLast
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "Peer sent error packet: code: {:?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: format!(
                    "Expected to receive an Ack packet, but got {:?} instead",
                    packet
                ),
            }),
        }
    }
}

#[derive(Debug)]
pub struct WriteProcessor {
    file: File,
    path: PathBuf,
    curr_block: u16,
    /// Blocks accumulate here on compressed transfers until the final one
    /// arrives and the whole body can be gunzipped into the file.
    compressed: Option<Vec<u8>>,
}

impl WriteProcessor {
    fn new(file: File, path: PathBuf, compress: bool) -> WriteProcessor {
        WriteProcessor {
            file,
            path,
            curr_block: 0,
            compressed: if compress { Some(Vec::new()) } else { None },
        }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => {
                if *block == self.curr_block.wrapping_add(1) {
                    let last = data.len() < BLOCK_SIZE;
                    if let Err(e) = self.append(data, last).await {
                        return ResultAction::TerminateWithPacket(tftp::Packet::Error {
                            code: e.kind().into(),
                            message: format!("Error writing to file: {:?}", e),
                        });
                    }
                    self.curr_block = *block;

                    let ack = tftp::Packet::Ack {
                        block: self.curr_block,
                    };
                    if last {
                        ResultAction::TerminateWithPacket(ack)
                    } else {
                        ResultAction::SendPacketAndAwait(ack)
                    }
                } else if *block == self.curr_block {
                    // Duplicated in transit; ack it again without writing.
                    log::warn!("Duplicate data block {}, resending previous ack", block);
                    ResultAction::ResendLast
                } else {
                    ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: tftp::ErrorCode::Illegal,
                        message: format!(
                            "Data blocks must be received in sequence. Received block {block}, \
                            but expected block {}.",
                            self.curr_block.wrapping_add(1)
                        ),
                    })
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "Peer sent error packet: code: {:?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: format!(
                    "Expected to receive a Data packet, but got {:?} instead",
                    packet
                ),
            }),
        }
    }

    async fn append(&mut self, data: &[u8], last: bool) -> Result<(), io::Error> {
        match &mut self.compressed {
            Some(body) => {
                body.extend_from_slice(data);
                if last {
                    let packed = std::mem::take(body);
                    let raw = Compressor::default().decompress(&packed)?;
                    self.file.write_all(&raw).await?;
                }
            }
            None => self.file.write_all(data).await?,
        }
        if last {
            self.file.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{ErrorCode, Packet};
    use tempdir::TempDir;

    async fn read_processor(contents: &[u8], compress: bool) -> PacketProcessor {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        std::fs::write(&path, contents).unwrap();
        PacketProcessor::new_for_reading(&path, compress).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_for_reading_invalid_path() {
        assert_eq!(
            PacketProcessor::new_for_reading(Path::new("/some/invalid/file.txt"), false)
                .await
                .err()
                .unwrap()
                .kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_read_first_packet_succeeds() {
        let mut processor = read_processor(b"testing", false).await;

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 1,
                data: b"testing".to_vec(),
            })
        );
    }

    #[tokio::test]
    async fn test_read_multiple_packets_succeeds() {
        let mut contents = vec![b'x'; 512];
        contents.extend_from_slice(b"testing");
        let mut processor = read_processor(&contents, false).await;

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 1,
                data: vec![b'x'; 512],
            })
        );

        assert_eq!(
            processor.process_packet(&Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 2,
                data: b"testing".to_vec(),
            })
        );

        assert_eq!(
            processor.process_packet(&Packet::Ack { block: 2 }).await,
            ResultAction::CloseConnection(None)
        );
    }

    #[tokio::test]
    async fn test_read_exact_multiple_ends_with_empty_block() {
        let mut processor = read_processor(&vec![b'A'; 512], false).await;

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 1,
                data: vec![b'A'; 512],
            })
        );

        assert_eq!(
            processor.process_packet(&Packet::Ack { block: 1 }).await,
            ResultAction::SendPacketAndAwait(Packet::Data {
                block: 2,
                data: vec![],
            })
        );

        assert_eq!(
            processor.process_packet(&Packet::Ack { block: 2 }).await,
            ResultAction::CloseConnection(None)
        );
    }

    #[tokio::test]
    async fn test_read_stale_ack_resends_current_block() {
        let mut contents = vec![b'x'; 512];
        contents.extend_from_slice(b"tail");
        let mut processor = read_processor(&contents, false).await;

        let _ = processor.first_packet().await;
        let _ = processor.process_packet(&Packet::Ack { block: 1 }).await;

        assert_eq!(
            processor.process_packet(&Packet::Ack { block: 1 }).await,
            ResultAction::ResendLast
        );

        // The session still finishes once the right ack shows up.
        assert_eq!(
            processor.process_packet(&Packet::Ack { block: 2 }).await,
            ResultAction::CloseConnection(None)
        );
    }

    #[tokio::test]
    async fn test_read_compressed_payload_gunzips_to_original() {
        let contents = b"some text that should squeeze down nicely".repeat(4);
        let mut processor = read_processor(&contents, true).await;

        match processor.first_packet().await {
            ResultAction::SendPacketAndAwait(Packet::Data { block: 1, data }) => {
                assert_eq!(Compressor::default().decompress(&data).unwrap(), contents);
            }
            other => panic!("expected a data packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_process_recv_error() {
        let mut processor = read_processor(b"xxxxxxxxtesting", false).await;
        let _ = processor.first_packet().await;

        assert_eq!(
            processor
                .process_packet(&Packet::Error {
                    code: ErrorCode::Undefined,
                    message: "whoops".to_string()
                })
                .await,
            ResultAction::CloseConnection(Some(
                "Peer sent error packet: code: Undefined, message: 'whoops'".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_process_read_invalid_packet() {
        let mut processor = read_processor(b"xxxxxxxxtesting", false).await;
        let _ = processor.first_packet().await;

        match processor
            .process_packet(&Packet::Data {
                block: 1,
                data: vec![0x01],
            })
            .await
        {
            ResultAction::TerminateWithPacket(Packet::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::Illegal)
            }
            other => panic!("expected a terminal error packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_new_for_writing_invalid_path() {
        assert_eq!(
            PacketProcessor::new_for_writing(Path::new("/some/invalid/path.txt"), false)
                .await
                .err()
                .unwrap()
                .kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_new_for_writing_refuses_existing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        std::fs::write(&path, b"already here").unwrap();

        assert_eq!(
            PacketProcessor::new_for_writing(&path, false)
                .await
                .err()
                .unwrap()
                .kind(),
            io::ErrorKind::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_write_first_packet_is_priming_datagram() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut processor = PacketProcessor::new_for_writing(&path, false).await.unwrap();

        assert_eq!(
            processor.first_packet().await,
            ResultAction::SendRawAndAwait(vec![0])
        );
    }

    #[tokio::test]
    async fn test_write_short_block_terminates_with_ack() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut processor = PacketProcessor::new_for_writing(&path, false).await.unwrap();
        let _ = processor.first_packet().await;

        assert_eq!(
            processor
                .process_packet(&Packet::Data {
                    block: 1,
                    data: b"xxxxxxxxtesting".to_vec(),
                })
                .await,
            ResultAction::TerminateWithPacket(Packet::Ack { block: 1 })
        );

        assert_eq!(std::fs::read(&path).unwrap(), b"xxxxxxxxtesting");
    }

    #[tokio::test]
    async fn test_write_multiple_packets_succeeds() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut processor = PacketProcessor::new_for_writing(&path, false).await.unwrap();
        let _ = processor.first_packet().await;

        assert_eq!(
            processor
                .process_packet(&Packet::Data {
                    block: 1,
                    data: vec![b'x'; 512],
                })
                .await,
            ResultAction::SendPacketAndAwait(Packet::Ack { block: 1 })
        );

        assert_eq!(
            processor
                .process_packet(&Packet::Data {
                    block: 2,
                    data: b"testing".to_vec(),
                })
                .await,
            ResultAction::TerminateWithPacket(Packet::Ack { block: 2 })
        );

        let mut expected = vec![b'x'; 512];
        expected.extend_from_slice(b"testing");
        assert_eq!(std::fs::read(&path).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_write_duplicate_block_reacks_without_writing() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut processor = PacketProcessor::new_for_writing(&path, false).await.unwrap();
        let _ = processor.first_packet().await;

        let block = Packet::Data {
            block: 1,
            data: vec![b'x'; 512],
        };
        let _ = processor.process_packet(&block).await;
        assert_eq!(
            processor.process_packet(&block).await,
            ResultAction::ResendLast
        );

        let _ = processor
            .process_packet(&Packet::Data {
                block: 2,
                data: vec![],
            })
            .await;
        assert_eq!(std::fs::read(&path).unwrap().len(), 512);
    }

    #[tokio::test]
    async fn test_write_out_of_order_block_fails() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut processor = PacketProcessor::new_for_writing(&path, false).await.unwrap();
        let _ = processor.first_packet().await;

        match processor
            .process_packet(&Packet::Data {
                block: 3,
                data: vec![0x01],
            })
            .await
        {
            ResultAction::TerminateWithPacket(Packet::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::Illegal)
            }
            other => panic!("expected a terminal error packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_compressed_body_gunzips_into_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let contents = b"payload worth squeezing".repeat(8);
        let packed = Compressor::default().compress(&contents).unwrap();
        assert!(packed.len() < BLOCK_SIZE);

        let mut processor = PacketProcessor::new_for_writing(&path, true).await.unwrap();
        let _ = processor.first_packet().await;

        assert_eq!(
            processor
                .process_packet(&Packet::Data {
                    block: 1,
                    data: packed,
                })
                .await,
            ResultAction::TerminateWithPacket(Packet::Ack { block: 1 })
        );
        assert_eq!(std::fs::read(&path).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_process_write_invalid_packet() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut processor = PacketProcessor::new_for_writing(&path, false).await.unwrap();
        let _ = processor.first_packet().await;

        match processor.process_packet(&Packet::Ack { block: 1 }).await {
            ResultAction::TerminateWithPacket(Packet::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::Illegal)
            }
            other => panic!("expected a terminal error packet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_removes_partial_output() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        let mut processor = PacketProcessor::new_for_writing(&path, false).await.unwrap();
        let _ = processor.first_packet().await;
        let _ = processor
            .process_packet(&Packet::Data {
                block: 1,
                data: vec![b'x'; 512],
            })
            .await;
        assert!(path.exists());

        processor.abort().await;
        assert!(!path.exists());
    }
}
