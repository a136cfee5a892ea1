use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io;
use std::io::{Read, Write};

/// Gzip filter wrapped around a transfer payload when the request carries
/// the compress flag. One operation runs at a time on an instance; each
/// session constructs its own.
pub struct Compressor {
    level: Compression,
}

impl Compressor {
    pub fn new(level: u32) -> Compressor {
        Compressor {
            level: Compression::new(level),
        }
    }

    pub fn compress(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }

    pub fn decompress(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        GzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Default for Compressor {
    fn default() -> Compressor {
        Compressor {
            level: Compression::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let input = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut compressor = Compressor::default();
        let packed = compressor.compress(&input).unwrap();
        assert_ne!(packed, input);
        assert_eq!(compressor.decompress(&packed).unwrap(), input);
    }

    #[test]
    fn test_empty_round_trip() {
        let mut compressor = Compressor::default();
        let packed = compressor.compress(b"").unwrap();
        assert_eq!(compressor.decompress(&packed).unwrap(), b"");
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        let mut compressor = Compressor::default();
        assert!(compressor.decompress(b"definitely not gzip").is_err());
    }

    #[test]
    fn test_explicit_level() {
        let input = vec![0x41; 4096];
        let packed = Compressor::new(9).compress(&input).unwrap();
        assert!(packed.len() < input.len());
        assert_eq!(Compressor::default().decompress(&packed).unwrap(), input);
    }
}
