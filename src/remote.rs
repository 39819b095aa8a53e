//! HTTP access to the remote archive service
//!
//! Two endpoints are used:
//! - `GET <base>/metadata/<item>`: JSON description of an item, including its files
//! - `GET <base>/download/<item>/<file>`: the bytes of one file
//!
//! When credentials are configured they are sent on both endpoints as
//! `Authorization: LOW <access>:<secret>`.

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::types::FileDescriptor;
use serde::{Deserialize, Deserializer};
use url::Url;

/// Shared HTTP client bound to one service root
#[derive(Clone)]
pub struct ArchiveClient {
    http: reqwest::Client,
    base_url: Url,
    authorization: Option<String>,
    metadata_timeout: std::time::Duration,
}

impl ArchiveClient {
    /// Build a client from the remote configuration
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            Error::config(
                "base_url",
                format!("invalid base URL '{}': {}", config.base_url, e),
            )
        })?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("archive-dl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout)
            .build()?;

        let authorization = config
            .credentials()
            .map(|(access, secret)| format!("LOW {access}:{secret}"));

        Ok(Self {
            http,
            base_url,
            authorization,
            metadata_timeout: config.metadata_timeout,
        })
    }

    /// URL of an item's metadata document
    pub fn metadata_url(&self, item: &str) -> Url {
        self.endpoint(&["metadata", item])
    }

    /// URL of one file of an item
    ///
    /// Each `/`-separated component of `file` becomes its own percent-encoded segment.
    pub fn download_url(&self, item: &str, file: &str) -> Url {
        let mut segments = vec!["download", item];
        segments.extend(file.split('/'));
        self.endpoint(&segments)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// GET request for an item's metadata, bounded by the metadata timeout
    pub(crate) fn metadata_request(&self, item: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(self.metadata_url(item)))
            .timeout(self.metadata_timeout)
    }

    /// GET request for the bytes of one file; deadlines are applied by the caller
    pub(crate) fn download_request(&self, item: &str, file: &str) -> reqwest::RequestBuilder {
        self.authorize(self.http.get(self.download_url(item, file)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.authorization {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        }
    }
}

/// The part of an item metadata document this crate reads
///
/// An unknown item comes back as `{}`, hence the optional `files`.
#[derive(Debug, Deserialize)]
pub(crate) struct ItemMetadata {
    #[serde(default)]
    pub(crate) files: Option<Vec<MetadataFile>>,
}

/// One entry of the `files` array
#[derive(Debug, Deserialize)]
pub(crate) struct MetadataFile {
    pub(crate) name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub(crate) size: Option<u64>,
    #[serde(default)]
    pub(crate) md5: Option<String>,
}

impl From<MetadataFile> for FileDescriptor {
    fn from(file: MetadataFile) -> Self {
        FileDescriptor {
            name: file.name,
            size: file.size,
            md5: file
                .md5
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty()),
        }
    }
}

/// Sizes arrive as decimal strings (`"1234"`), occasionally as numbers
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}
