// Blob storage HTTP calls for vmsnap-agent

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use std::time::Duration;
use url::Url;

/// Storage service version sent with every request
pub const STORAGE_API_VERSION: &str = "2015-02-21";

/// Default timeout for status and log uploads
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the HTTP client used for blob calls
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Append a query parameter to a (possibly SAS-signed) blob URI
pub fn with_query(uri: &str, key: &str, value: &str) -> Result<String> {
    let mut url = Url::parse(uri).with_context(|| format!("Invalid blob URI {uri}"))?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url.into())
}

/// Writes whole block blobs
pub struct BlobWriter {
    client: Client,
}

impl BlobWriter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client(UPLOAD_TIMEOUT)?,
        })
    }

    /// Replace the blob at `uri` with `body`
    pub fn put_block_blob(&self, uri: &str, body: &[u8], content_type: &str) -> Result<()> {
        let response = self
            .client
            .put(uri)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", STORAGE_API_VERSION)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, body.len())
            .body(body.to_vec())
            .send()
            .context("Blob upload request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Blob upload returned HTTP {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_query() {
        assert_eq!(
            with_query("https://a/c/b.vhd?sig=x%2By", "comp", "snapshot").unwrap(),
            "https://a/c/b.vhd?sig=x%2By&comp=snapshot"
        );
        assert_eq!(
            with_query("https://a/c/b.vhd", "comp", "snapshot").unwrap(),
            "https://a/c/b.vhd?comp=snapshot"
        );
        assert_eq!(
            with_query("https://a/c/b.vhd", "snapshot", "2024-01-01T00:00:00Z").unwrap(),
            "https://a/c/b.vhd?snapshot=2024-01-01T00%3A00%3A00Z"
        );
        assert!(with_query("os.vhd", "comp", "snapshot").is_err());
    }
}
