use std::io;

/// Compress a payload with Brotli at the default quality.
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let params = brotli::enc::BrotliEncoderParams::default();
    let mut out = Vec::new();
    brotli::BrotliCompress(&mut io::Cursor::new(data), &mut out, &params)?;
    Ok(out)
}

/// Decompress a Brotli stream.
pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::BrotliDecompress(&mut io::Cursor::new(data), &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(64);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_empty_round_trip() {
        let packed = compress(b"").unwrap();
        assert_eq!(decompress(&packed).unwrap(), b"");
    }

    #[test]
    fn test_garbage_input_fails() {
        assert!(decompress(b"\x00definitely not brotli\xff").is_err());
    }
}
