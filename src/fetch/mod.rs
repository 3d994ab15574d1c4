// src/fetch/mod.rs

use std::fmt;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::PathBuf;

use flate2::bufread::MultiGzDecoder;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, error, instrument};
use url::Url;

use crate::log::{RetryPolicy, Transient};

pub mod census;

pub use census::{census_url, Month};

/// Where a stream of fixed-width records comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    File(PathBuf),
    Url(Url),
}

impl SourceLocator {
    /// `http://` and `https://` locators are URLs; anything else is a path.
    pub fn parse(s: &str) -> Self {
        match Url::parse(s) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => SourceLocator::Url(u),
            _ => SourceLocator::File(PathBuf::from(s)),
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::File(p) => write!(f, "{}", p.display()),
            SourceLocator::Url(u) => write!(f, "{}", u),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GET {url} failed: {source}")]
    Http {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Transient for FetchError {
    /// Transport errors and 5xx responses are worth another attempt.
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Http { source, .. } => match source.status() {
                Some(s) => s.is_server_error(),
                None => true,
            },
            FetchError::Io { .. } => false,
        }
    }
}

async fn get_bytes_core(client: &Client, url: &Url) -> Result<Vec<u8>, FetchError> {
    debug!(%url, "Fetching");
    let http = |source| FetchError::Http {
        url: url.clone(),
        source,
    };
    let bytes = client
        .get(url.clone())
        .send()
        .await
        .map_err(http)?
        .error_for_status()
        .map_err(http)?
        .bytes()
        .await
        .map_err(http)?;
    Ok(bytes.to_vec())
}

async fn get_bytes_with_retry(
    client: &Client,
    url: &Url,
    retry: RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    retry
        .run("fetch", || get_bytes_core(client, url))
        .await
        .inspect_err(|e| error!(%url, error = %e, "Giving up on source"))
}

/// Loads the raw (possibly compressed) payload behind `locator`.
#[instrument(level = "debug", skip(client, retry), fields(source = %locator))]
pub async fn load(
    client: &Client,
    locator: &SourceLocator,
    retry: RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    match locator {
        SourceLocator::File(path) => {
            tokio::fs::read(path)
                .await
                .map_err(|source| FetchError::Io {
                    path: path.clone(),
                    source,
                })
        }
        SourceLocator::Url(url) => get_bytes_with_retry(client, url, retry).await,
    }
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Line reader over a loaded payload. Gzip (including multi-member) is
/// detected by its magic bytes; anything else is read as plain text.
/// Corrupt compressed data surfaces as an `io::Error` while reading.
pub fn decode(payload: Vec<u8>) -> Box<dyn BufRead + Send> {
    if payload.starts_with(&GZIP_MAGIC) {
        Box::new(BufReader::new(MultiGzDecoder::new(Cursor::new(payload))))
    } else {
        Box::new(Cursor::new(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::{Read, Write};

    fn gzip(text: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    fn read_all(mut r: Box<dyn BufRead + Send>) -> io::Result<String> {
        let mut s = String::new();
        r.read_to_string(&mut s)?;
        Ok(s)
    }

    #[test]
    fn locators_distinguish_urls_from_paths() {
        assert!(matches!(
            SourceLocator::parse("https://www2.census.gov/x.dat.gz"),
            SourceLocator::Url(_)
        ));
        assert_eq!(
            SourceLocator::parse("data/jan20pub.dat.gz"),
            SourceLocator::File(PathBuf::from("data/jan20pub.dat.gz"))
        );
        // a drive-letter style "scheme" is still a path
        assert!(matches!(
            SourceLocator::parse("c:/data/x.dat"),
            SourceLocator::File(_)
        ));
    }

    #[test]
    fn decode_handles_gzip_and_plain_text() {
        assert_eq!(read_all(decode(gzip("a\nb\n"))).unwrap(), "a\nb\n");
        assert_eq!(read_all(decode(b"plain\n".to_vec())).unwrap(), "plain\n");
        assert_eq!(read_all(decode(Vec::new())).unwrap(), "");
    }

    #[test]
    fn truncated_gzip_is_a_read_error() {
        let mut gz = gzip(&"record line\n".repeat(100));
        gz.truncate(gz.len() / 2);
        assert!(read_all(decode(gz)).is_err());
    }

    #[tokio::test]
    async fn load_reads_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jan20pub.dat.gz");
        std::fs::write(&path, gzip("line\n")).unwrap();

        let loc = SourceLocator::File(path);
        let bytes = load(&Client::new(), &loc, RetryPolicy::NONE).await.unwrap();
        assert_eq!(read_all(decode(bytes)).unwrap(), "line\n");
    }

    #[tokio::test]
    async fn missing_file_is_a_fetch_error() {
        let loc = SourceLocator::File(PathBuf::from("/definitely/not/here.dat"));
        let err = load(&Client::new(), &loc, RetryPolicy::NONE)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }
}
