//! Content checksums: base64-encoded MD5, the form the remote stores.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hash a stream to its base64 MD5
pub async fn compute_checksum<R>(mut reader: R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(STANDARD.encode(hasher.finalize()))
}

pub fn checksum_of(bytes: &[u8]) -> String {
    STANDARD.encode(Md5::digest(bytes))
}

/// Whether `checksum` is a canonical base64 encoding of 16 bytes
pub fn is_valid_checksum(checksum: &str) -> bool {
    match STANDARD.decode(checksum) {
        Ok(bytes) => bytes.len() == 16 && STANDARD.encode(&bytes) == checksum,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compute_checksum_matches_in_memory() {
        let data = b"hello".to_vec();
        let streamed = compute_checksum(std::io::Cursor::new(data.clone()))
            .await
            .unwrap();
        assert_eq!(streamed, "XUFAKrxLKna5cZ2REBfFkg==");
        assert_eq!(checksum_of(&data), streamed);
    }

    #[test]
    fn test_is_valid_checksum() {
        assert!(is_valid_checksum("XUFAKrxLKna5cZ2REBfFkg=="));
        assert!(!is_valid_checksum("XUFAKrxLKna5cZ2REBfF"));
        assert!(!is_valid_checksum("not base64!"));
        // 12 bytes, well-formed but too short
        assert!(!is_valid_checksum("AAAAAAAAAAAAAAAA"));
    }
}
