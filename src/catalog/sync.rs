//! Catalog download
//!
//! Fetches a catalog file from a user-supplied URL. The body is streamed to
//! a temp file next to the destination, checked, parsed, and only then
//! moved into place so a failed sync never clobbers a working catalog.

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::{Catalog, CatalogError};

/// Environment variable that disables all network access
pub const OFFLINE_ENV: &str = "CHIPMARK_OFFLINE";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Download a catalog to `dest`, returning the number of parts it holds
pub fn sync_catalog(url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<usize> {
    if std::env::var(OFFLINE_ENV).is_ok() {
        return Err(CatalogError::Offline(url.to_string()).into());
    }

    info!("Syncing catalog from {}", url);

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = dest.with_extension("tmp");
    let rt = Runtime::new().context("Failed to create tokio runtime")?;
    let hash = rt.block_on(download_to(url, &temp_path))?;

    let parts = finish_download(&temp_path, dest, &hash, expected_sha256)?;
    info!("Catalog synced: {} parts written to {:?}", parts, dest);
    Ok(parts)
}

/// Stream `url` into `path`, returning the hex SHA-256 of the body
async fn download_to(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send catalog request")?;

    if !response.status().is_success() {
        return Err(CatalogError::Download(format!("status {} from {}", response.status(), url)).into());
    }

    debug!("Catalog size: {:?} bytes", response.content_length());

    stream_to_file(response.bytes_stream(), path, |p| std::fs::File::create(p)).await
}

/// Write every chunk of `stream` to a file at `path`, returning the hex SHA-256
///
/// Any failure once the file exists removes it again.
async fn stream_to_file<S, B, E, W, F>(mut stream: S, path: &Path, create: F) -> Result<String>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
    W: Write,
    F: FnOnce(&Path) -> std::io::Result<W>,
{
    let mut file = create(path).context("Failed to create temp file")?;
    let mut hasher = Sha256::new();

    let written: Result<()> = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CatalogError::Download(e.to_string()))?;
            file.write_all(chunk.as_ref()).context("Failed to write to temp file")?;
            hasher.update(chunk.as_ref());
        }
        file.flush().context("Failed to flush temp file")?;
        Ok(())
    }
    .await;

    drop(file);
    if let Err(e) = written {
        std::fs::remove_file(path).ok();
        return Err(e);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify and parse the downloaded file, then move it over `dest`
fn finish_download(temp_path: &Path, dest: &Path, hash: &str, expected_sha256: Option<&str>) -> Result<usize> {
    let discard = |err: anyhow::Error| {
        std::fs::remove_file(temp_path).ok();
        err
    };

    if let Some(expected) = expected_sha256 {
        if !hash.eq_ignore_ascii_case(expected.trim()) {
            return Err(discard(
                CatalogError::ChecksumMismatch {
                    expected: expected.trim().to_lowercase(),
                    actual: hash.to_string(),
                }
                .into(),
            ));
        }
        info!("Checksum verified");
    }

    let content = std::fs::read_to_string(temp_path)
        .context("Failed to read downloaded catalog")
        .map_err(discard)?;
    let extension = dest.extension().and_then(|e| e.to_str()).unwrap_or("json");
    let catalog = Catalog::parse(&content, extension)
        .context("Downloaded catalog is not valid")
        .map_err(discard)?;

    std::fs::rename(temp_path, dest).context("Failed to move catalog to final location")?;
    Ok(catalog.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{"parts":[{"part_number":"LM358","manufacturer":"Texas Instruments"}]}"#;

    fn sha256_hex(data: &str) -> String {
        format!("{:x}", Sha256::digest(data.as_bytes()))
    }

    #[test]
    fn test_finish_download_moves_valid_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("catalog.json");
        let temp = dest.with_extension("tmp");
        std::fs::write(&temp, CATALOG).unwrap();

        let hash = sha256_hex(CATALOG);
        let parts = finish_download(&temp, &dest, &hash, Some(&hash.to_uppercase())).unwrap();

        assert_eq!(parts, 1);
        assert!(dest.exists());
        assert!(!temp.exists());
    }

    #[test]
    fn test_checksum_mismatch_keeps_existing_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("catalog.json");
        std::fs::write(&dest, "previous").unwrap();
        let temp = dest.with_extension("tmp");
        std::fs::write(&temp, CATALOG).unwrap();

        let err = finish_download(&temp, &dest, &sha256_hex(CATALOG), Some("deadbeef")).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::ChecksumMismatch { .. })
        ));
        assert!(!temp.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "previous");
    }

    #[test]
    fn test_invalid_catalog_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("catalog.json");
        let temp = dest.with_extension("tmp");
        std::fs::write(&temp, "<html>not a catalog</html>").unwrap();

        assert!(finish_download(&temp, &dest, "", None).is_err());
        assert!(!dest.exists());
        assert!(!temp.exists());
    }

    /// Writer that accepts `limit` bytes and then fails like a full disk
    struct FullDisk {
        file: std::fs::File,
        limit: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if buf.len() > self.limit {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"));
            }
            self.limit -= buf.len();
            self.file.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.file.flush()
        }
    }

    fn chunks(items: Vec<std::result::Result<&'static str, &'static str>>) -> impl Stream<Item = std::result::Result<&'static str, &'static str>> + Unpin {
        futures_util::stream::iter(items)
    }

    #[test]
    fn test_stream_to_file_hashes_body() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("catalog.tmp");
        let rt = Runtime::new().unwrap();

        let hash = rt
            .block_on(stream_to_file(chunks(vec![Ok(&CATALOG[..10]), Ok(&CATALOG[10..])]), &temp, |p| {
                std::fs::File::create(p)
            }))
            .unwrap();

        assert_eq!(hash, sha256_hex(CATALOG));
        assert_eq!(std::fs::read_to_string(&temp).unwrap(), CATALOG);
    }

    #[test]
    fn test_write_failure_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("catalog.tmp");
        let rt = Runtime::new().unwrap();

        let err = rt
            .block_on(stream_to_file(chunks(vec![Ok("{\"parts\""), Ok(":[]}")]), &temp, |p| {
                Ok(FullDisk {
                    file: std::fs::File::create(p)?,
                    limit: 9,
                })
            }))
            .unwrap_err();

        assert!(err.to_string().contains("Failed to write to temp file"));
        assert!(!temp.exists());
    }

    #[test]
    fn test_stream_error_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("catalog.tmp");
        let rt = Runtime::new().unwrap();

        let err = rt
            .block_on(stream_to_file(chunks(vec![Ok("{"), Err("connection reset")]), &temp, |p| {
                std::fs::File::create(p)
            }))
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::Download(_))
        ));
        assert!(!temp.exists());
    }

    #[test]
    fn test_offline_mode_refuses() {
        std::env::set_var(OFFLINE_ENV, "1");
        let dir = tempfile::tempdir().unwrap();
        let err = sync_catalog("https://example.invalid/catalog.json", &dir.path().join("c.json"), None)
            .unwrap_err();
        std::env::remove_var(OFFLINE_ENV);

        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::Offline(_))
        ));
    }
}
