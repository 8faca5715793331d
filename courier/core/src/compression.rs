//! Payload compression shared by the frame codec and the stream engine

use std::io::{self, Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

/// Compress data using zlib
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress zlib data, refusing output larger than `limit` bytes
pub fn decompress(data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)?;

    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed payload exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_shrinks_repetitive_data() {
        let data = vec![b'a'; 8192];
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_decompress_enforces_limit() {
        let packed = compress(&vec![0u8; 4096]).unwrap();
        assert!(decompress(&packed, 1024).is_err());
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"definitely not zlib", 1024).is_err());
    }
}
