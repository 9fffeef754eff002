//! Streaming SHA-256 content digests.

use std::fmt;
use std::io::{Error, ErrorKind};
use std::time::Duration;

use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of a byte sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Checksum {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Digest a stream without buffering it whole.
pub async fn digest<R>(reader: R) -> std::io::Result<Checksum>
where
    R: AsyncRead + Unpin,
{
    digest_stream(reader, None).await
}

/// Digest a stream, failing with `ErrorKind::TimedOut` when a single read
/// stalls for longer than `per_read`. The whole digest may take as long as
/// the stream keeps making progress.
pub async fn digest_with_read_timeout<R>(reader: R, per_read: Duration) -> std::io::Result<Checksum>
where
    R: AsyncRead + Unpin,
{
    digest_stream(reader, Some(per_read)).await
}

async fn digest_stream<R>(mut reader: R, per_read: Option<Duration>) -> std::io::Result<Checksum>
where
    R: AsyncRead + Unpin,
{
    let mut context = Context::new(&SHA256);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match per_read {
            Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf))
                .await
                .map_err(|_| Error::new(ErrorKind::TimedOut, "read stalled while hashing"))??,
            None => reader.read(&mut buf).await?,
        };
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }

    Ok(Checksum(hex::encode(context.finish())))
}

/// Digest an in-memory payload.
pub fn digest_bytes(data: &[u8]) -> Checksum {
    let mut context = Context::new(&SHA256);
    context.update(data);
    Checksum(hex::encode(context.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_digest_bytes_known_value() {
        assert_eq!(digest_bytes(b"hello").as_str(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_stream_matches_in_memory_digest() {
        // Larger than one chunk so the loop runs more than once
        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        let streamed = digest(data.as_slice()).await.unwrap();
        assert_eq!(streamed, digest_bytes(&data));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let streamed = digest(&b""[..]).await.unwrap();
        assert_eq!(
            streamed.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_stalled_read_times_out() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut writer, b"partial")
            .await
            .unwrap();

        // The writer stays open, so the second read never completes
        let result = digest_with_read_timeout(reader, Duration::from_millis(50)).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::TimedOut);
        drop(writer);
    }

    #[tokio::test]
    async fn test_bounded_digest_matches_plain_digest() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 4).map(|i| (i % 13) as u8).collect();
        let streamed = digest_with_read_timeout(data.as_slice(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(streamed, digest_bytes(&data));
    }

    #[test]
    fn test_single_byte_difference_changes_digest() {
        assert_ne!(digest_bytes(b"hello"), digest_bytes(b"hellp"));
    }
}
