use crate::cli::progress::ProgressBar;
use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::{
    fmt::Display,
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use strum::{Display as StrumDisplay, EnumString};
use tracing::{debug, info, warn};
use url::Url;

/// Retrieves a remote image to local storage.
pub trait Fetch {
    /// Make sure `dest` holds a complete copy of `url`. An existing file is
    /// reused unless it fails the checksum.
    fn fetch(&self, url: &Url, dest: &Path, checksum: Option<&Checksum>) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// An expected digest in the form `<algorithm>:<hex>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

impl FromStr for Checksum {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, digest) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid checksum: {}", s))?;

        let algorithm = algorithm
            .parse::<HashAlgorithm>()
            .map_err(|_| anyhow!("Unsupported hash: {}", algorithm))?;

        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("Invalid checksum: {}", s);
        }

        Ok(Self {
            algorithm,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Checksum {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

impl Checksum {
    /// Hash the file and compare against the expected digest.
    pub fn verify(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let len = std::fs::metadata(path)?.len();

        info!(algorithm = %self.algorithm, "Computing checksum");
        let hash = match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                ProgressBar::Hash.copy(&mut file, &mut hasher, Some(len))?;
                hex::encode(hasher.finalize())
            }
            HashAlgorithm::Sha512 => {
                let mut hasher = Sha512::new();
                ProgressBar::Hash.copy(&mut file, &mut hasher, Some(len))?;
                hex::encode(hasher.finalize())
            }
        };

        debug!("Computed: {}", &hash);
        debug!("Expected: {}", &self.digest);

        if hash != self.digest {
            bail!("Hash mismatch for {}", path.display());
        }
        Ok(())
    }
}

/// Downloads over HTTP(S) and copies `file://` sources. Transfers land in a
/// `.part` file that only becomes the destination once complete.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("templater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()?;

        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }

    fn transfer(&self, url: &Url, path: &Path) -> Result<()> {
        if url.scheme() == "file" {
            let source = url
                .to_file_path()
                .map_err(|_| anyhow!("Invalid file URL: {}", url))?;

            info!(source = %source.display(), "Copying local image");
            std::fs::copy(&source, path)?;
            return Ok(());
        }

        let mut rs = self.client.get(url.clone()).send()?;
        if !rs.status().is_success() {
            bail!("Failed to download: HTTP {}", rs.status());
        }

        let length = rs.content_length();
        let mut file = File::create(path)?;

        info!(size = ?length, "Saving image");
        let copied = ProgressBar::Download.copy(&mut rs, &mut file, length)?;
        file.sync_all()?;

        if let Some(length) = length {
            if copied != length {
                bail!("Truncated download: received {} of {} bytes", copied, length);
            }
        }
        Ok(())
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &Url, dest: &Path, checksum: Option<&Checksum>) -> Result<()> {
        if dest.is_file() {
            match checksum {
                None => {
                    info!(path = %dest.display(), "File already exists, skipping download");
                    return Ok(());
                }
                Some(checksum) => match checksum.verify(dest) {
                    Ok(()) => {
                        info!(path = %dest.display(), "File already exists and matches checksum, skipping download");
                        return Ok(());
                    }
                    Err(error) => {
                        info!(error = %error, "Deleting corrupt downloaded file");
                        std::fs::remove_file(dest)?;
                    }
                },
            }
        }

        info!(url = %url, path = %dest.display(), "Downloading image");
        let partial = partial_path(dest);

        let result = self
            .transfer(url, &partial)
            .and_then(|_| match checksum {
                Some(checksum) => checksum.verify(&partial),
                None => Ok(()),
            })
            .and_then(|_| {
                std::fs::rename(&partial, dest)
                    .with_context(|| format!("Failed to move download to {}", dest.display()))
            });

        match result {
            Ok(()) => {
                info!(path = %dest.display(), "Successfully downloaded image");
                Ok(())
            }
            Err(error) => {
                if partial.exists() {
                    if let Err(cleanup) = std::fs::remove_file(&partial) {
                        warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial download");
                    }
                }
                Err(error)
            }
        }
    }
}

/// The in-progress location for a download.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpListener,
    };

    /// Serve a single HTTP response on a random local port.
    fn serve_once(status: &str, body: &'static [u8]) -> Url {
        serve_with_length(status, body.len(), body)
    }

    /// Serve a single response that claims `content_length` bytes but sends `body`.
    fn serve_with_length(status: &str, content_length: usize, body: &'static [u8]) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let status = status.to_string();

        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request);
                let header = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(body);
            }
        });

        Url::parse(&format!("http://127.0.0.1:{port}/image.qcow2")).unwrap()
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::with_client(
            reqwest::blocking::Client::builder()
                .no_proxy()
                .build()
                .unwrap(),
        )
    }

    fn sha256(data: &[u8]) -> Checksum {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
            .parse()
            .unwrap()
    }

    /// A URL nothing is listening on.
    fn unreachable_url() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Url::parse(&format!("http://127.0.0.1:{port}/image.qcow2")).unwrap()
    }

    #[test]
    fn test_checksum_parse() {
        let checksum: Checksum = "SHA512:ABCDEF".parse().unwrap();
        assert_eq!(checksum.algorithm, HashAlgorithm::Sha512);
        assert_eq!(checksum.to_string(), "sha512:abcdef");

        assert!("sha256".parse::<Checksum>().is_err());
        assert!("md5:abcdef".parse::<Checksum>().is_err());
        assert!("sha256:not-hex".parse::<Checksum>().is_err());
    }

    #[test_log::test]
    fn test_existing_file_is_not_downloaded_again() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("image.qcow2");
        std::fs::write(&dest, b"already here")?;

        let url = unreachable_url();
        fetcher().fetch(&url, &dest, None)?;
        fetcher().fetch(&url, &dest, None)?;

        assert_eq!(std::fs::read(&dest)?, b"already here");
        Ok(())
    }

    #[test_log::test]
    fn test_download() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("image.qcow2");

        let url = serve_once("200 OK", b"qcow2 image data");
        fetcher().fetch(&url, &dest, Some(&sha256(b"qcow2 image data")))?;

        assert_eq!(std::fs::read(&dest)?, b"qcow2 image data");
        assert!(!partial_path(&dest).exists());
        Ok(())
    }

    #[test_log::test]
    fn test_connection_failure_leaves_no_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("image.qcow2");

        assert!(fetcher().fetch(&unreachable_url(), &dest, None).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        Ok(())
    }

    #[test_log::test]
    fn test_http_error_leaves_no_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("image.qcow2");

        let url = serve_once("404 Not Found", b"missing");
        assert!(fetcher().fetch(&url, &dest, None).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        Ok(())
    }

    #[test_log::test]
    fn test_truncated_download_leaves_no_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("image.qcow2");

        let url = serve_with_length("200 OK", 1024, b"only part of the image");
        assert!(fetcher().fetch(&url, &dest, None).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        Ok(())
    }

    #[test_log::test]
    fn test_checksum_mismatch_leaves_no_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("image.qcow2");

        let url = serve_once("200 OK", b"tampered");
        assert!(
            fetcher()
                .fetch(&url, &dest, Some(&sha256(b"original")))
                .is_err()
        );
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        Ok(())
    }

    #[test_log::test]
    fn test_corrupt_existing_file_is_replaced() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("image.qcow2");
        std::fs::write(&dest, b"trunc")?;

        let url = serve_once("200 OK", b"complete image");
        fetcher().fetch(&url, &dest, Some(&sha256(b"complete image")))?;

        assert_eq!(std::fs::read(&dest)?, b"complete image");
        Ok(())
    }

    #[test_log::test]
    fn test_file_url_is_copied() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("source.img");
        let dest = tmp.path().join("image.img");
        std::fs::write(&source, b"local image")?;

        let url = Url::from_file_path(&source).unwrap();
        fetcher().fetch(&url, &dest, None)?;

        assert_eq!(std::fs::read(&dest)?, b"local image");
        Ok(())
    }
}
