//! Checksummed JSON snapshot files
//!
//! Layout: one header line `health-ingest-snapshot v<N> crc64=<hex>`
//! followed by the JSON body. The checksum covers the body bytes. Writes go
//! to a temp file that is renamed over the target, so a reader sees either
//! the previous snapshot or the new one.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::PersistenceError;

const MAGIC: &str = "health-ingest-snapshot";

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u16 = 1;

fn checksum(data: &[u8]) -> u64 {
    crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182).checksum(data)
}

/// Serialize `value` and atomically replace the file at `path`
pub async fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<u64, PersistenceError> {
    let body =
        serde_json::to_vec(value).map_err(|e| PersistenceError::Encoding(e.to_string()))?;
    let header = format!(
        "{} v{} crc64={:016x}\n",
        MAGIC,
        SNAPSHOT_VERSION,
        checksum(&body)
    );

    let mut contents = Vec::with_capacity(header.len() + body.len());
    contents.extend_from_slice(header.as_bytes());
    contents.extend_from_slice(&body);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    // Atomic write: write to temp file, then rename
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &contents).await?;
    fs::rename(&temp_path, path).await?;

    Ok(contents.len() as u64)
}

/// Read and verify a snapshot; `Ok(None)` when the file does not exist
pub async fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let contents = match fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let newline = contents
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| PersistenceError::Encoding("missing snapshot header".to_string()))?;
    let header = std::str::from_utf8(&contents[..newline])
        .map_err(|e| PersistenceError::Encoding(e.to_string()))?;
    let body = &contents[newline + 1..];

    let (version, expected) = parse_header(header)?;
    if version > SNAPSHOT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(version));
    }

    let actual = checksum(body);
    if actual != expected {
        return Err(PersistenceError::Corrupted {
            path: path.display().to_string(),
            expected,
            actual,
        });
    }

    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| PersistenceError::Encoding(e.to_string()))
}

fn parse_header(header: &str) -> Result<(u16, u64), PersistenceError> {
    let bad = || PersistenceError::Encoding(format!("invalid snapshot header '{}'", header));

    let mut parts = header.split_whitespace();
    if parts.next() != Some(MAGIC) {
        return Err(bad());
    }
    let version = parts
        .next()
        .and_then(|v| v.strip_prefix('v'))
        .and_then(|v| v.parse::<u16>().ok())
        .ok_or_else(bad)?;
    let checksum = parts
        .next()
        .and_then(|c| c.strip_prefix("crc64="))
        .and_then(|c| u64::from_str_radix(c, 16).ok())
        .ok_or_else(bad)?;
    Ok((version, checksum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("snap.json");

        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u32);
        write_snapshot(&path, &value).await.unwrap();

        let restored: Option<BTreeMap<String, u32>> = read_snapshot(&path).await.unwrap();
        assert_eq!(restored, Some(value));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let restored: Option<Vec<u32>> = read_snapshot(&dir.path().join("nope")).await.unwrap();
        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snap.json");
        write_snapshot(&path, &vec![1u32, 2, 3]).await.unwrap();

        let mut contents = std::fs::read(&path).unwrap();
        let last = contents.len() - 2;
        contents[last] = b'9';
        std::fs::write(&path, contents).unwrap();

        let err = read_snapshot::<Vec<u32>>(&path).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snap.json");
        std::fs::write(&path, format!("{} v9 crc64=0000000000000000\n[]", MAGIC)).unwrap();

        let err = read_snapshot::<Vec<u32>>(&path).await.unwrap_err();
        assert!(matches!(err, PersistenceError::UnsupportedVersion(9)));
    }
}
