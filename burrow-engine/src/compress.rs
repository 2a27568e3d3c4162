//! zlib packet compression
//!
//! Tunneled packets may be compressed per direction; the stream format is
//! plain zlib so either side can be swapped out independently.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Compress a packet.
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::best(),
    );
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress a packet, refusing to inflate beyond `max` bytes.
pub fn decompress(data: &[u8], max: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(max as u64 + 1);
    decoder.read_to_end(&mut out)?;
    if out.len() > max {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("decompressed packet exceeds {} bytes", max),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data: Vec<u8> = (0..2000u32).map(|v| (v % 251) as u8).collect();
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, 64 * 1024).unwrap(), data);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decompress(b"not a zlib stream", 1024).is_err());
    }

    #[test]
    fn test_size_cap() {
        let data = vec![0u8; 10_000];
        let packed = compress(&data).unwrap();
        assert!(decompress(&packed, 1024).is_err());
        assert_eq!(decompress(&packed, 10_000).unwrap(), data);
    }
}
