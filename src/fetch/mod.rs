//! Image Fetcher: stream an OS image from object storage into a temp file.
//!
//! The store is behind [`ObjectStore`]; [`S3Store`] talks to S3 (or an
//! S3-compatible endpoint) over HTTPS, anonymously or with SigV4 signing.
//! [`ImageFetcher`] owns the local side: temp file placement, progress
//! events and the length check.

pub mod sigv4;

use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::{AwsCredentials, ProvisionConfig};
use crate::error::{ProvisionError, Result};
use crate::process_guard;

const CHUNK_SIZE: usize = 64 * 1024;

/// Read access to a bucket of objects.
pub trait ObjectStore {
    /// Size of the object in bytes (single metadata query).
    fn content_length(&self, bucket: &str, key: &str) -> Result<u64>;

    /// Stream the object into `sink`, calling `progress` with the size of each
    /// chunk written. Returns the number of bytes written.
    fn download(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64>;
}

/// Where an object lives and how its request line is signed
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectUrl {
    url: String,
    host: String,
    canonical_uri: String,
}

/// [`ObjectStore`] over the S3 REST API.
pub struct S3Store {
    agent: ureq::Agent,
    region: String,
    endpoint: Option<String>,
    credentials: Option<AwsCredentials>,
}

impl S3Store {
    pub fn new(
        region: impl Into<String>,
        endpoint: Option<String>,
        credentials: Option<AwsCredentials>,
    ) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            region: region.into(),
            endpoint,
            credentials,
        }
    }

    /// Build a store for `config`. Protected buckets require credentials.
    pub fn from_config(config: &ProvisionConfig, credentials: Option<AwsCredentials>) -> Result<Self> {
        if config.protected && credentials.is_none() {
            return Err(ProvisionError::config(
                "bucket is marked protected but AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY are not set",
            ));
        }
        match &credentials {
            Some(creds) => info!(access_key_id = %creds.access_key_id, "using signed S3 requests"),
            None => info!("no AWS credentials, using anonymous S3 requests"),
        }
        Ok(Self::new(&config.region, config.endpoint.clone(), credentials))
    }

    /// Virtual-hosted style on AWS, path style on a custom endpoint.
    fn object_url(&self, bucket: &str, key: &str) -> ObjectUrl {
        let key = sigv4::encode_key(key.trim_start_matches('/'));
        match &self.endpoint {
            Some(endpoint) => {
                let base = endpoint.trim_end_matches('/');
                let host = base
                    .split_once("://")
                    .map_or(base, |(_, rest)| rest)
                    .split('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let canonical_uri = format!("/{}/{}", bucket, key);
                ObjectUrl {
                    url: format!("{}{}", base, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", bucket, self.region);
                let canonical_uri = format!("/{}", key);
                ObjectUrl {
                    url: format!("https://{}{}", host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    fn auth_headers(&self, method: &str, target: &ObjectUrl) -> Vec<(&'static str, String)> {
        let Some(credentials) = &self.credentials else {
            return Vec::new();
        };
        let request = sigv4::RequestToSign {
            method,
            host: &target.host,
            canonical_uri: &target.canonical_uri,
            region: &self.region,
            now: OffsetDateTime::now_utc(),
        };
        sigv4::sign(credentials, &request).headers
    }
}

pub(crate) fn fetch_failed(bucket: &str, key: &str, reason: impl ToString) -> ProvisionError {
    ProvisionError::FetchFailed {
        bucket: bucket.to_string(),
        object: key.to_string(),
        reason: reason.to_string(),
    }
}

impl ObjectStore for S3Store {
    fn content_length(&self, bucket: &str, key: &str) -> Result<u64> {
        let target = self.object_url(bucket, key);
        debug!(url = %target.url, "HEAD object");

        let mut request = self.agent.head(&target.url);
        for (name, value) in self.auth_headers("HEAD", &target) {
            request = request.header(name, value);
        }
        let response = request.call().map_err(|e| fetch_failed(bucket, key, e))?;

        response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| fetch_failed(bucket, key, "response carried no Content-Length"))
    }

    fn download(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        let target = self.object_url(bucket, key);
        debug!(url = %target.url, "GET object");

        let mut request = self.agent.get(&target.url);
        for (name, value) in self.auth_headers("GET", &target) {
            request = request.header(name, value);
        }
        let response = request.call().map_err(|e| fetch_failed(bucket, key, e))?;
        let mut reader = response.into_body().into_reader();

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            process_guard::check_interrupted()?;
            let n = reader.read(&mut buf).map_err(|e| fetch_failed(bucket, key, e))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            total += n as u64;
            progress(n as u64);
        }
        Ok(total)
    }
}

/// Progress events emitted while fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProgress {
    /// Object size is known; emitted once before any bytes
    Started { total: u64 },
    /// This many more bytes were written
    Advanced(u64),
}

/// A downloaded image. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct ImageFile {
    file: NamedTempFile,
    size: u64,
}

impl ImageFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Downloads images from an [`ObjectStore`] to local temp files.
pub struct ImageFetcher<'a> {
    store: &'a dyn ObjectStore,
    download_dir: Option<PathBuf>,
}

impl<'a> ImageFetcher<'a> {
    pub fn new(store: &'a dyn ObjectStore, download_dir: Option<PathBuf>) -> Self {
        Self { store, download_dir }
    }

    /// Fetch `bucket/object` into a new temp file.
    ///
    /// On any failure the partial file is removed before returning.
    pub fn fetch(
        &self,
        bucket: &str,
        object: &str,
        progress: &mut dyn FnMut(FetchProgress),
    ) -> Result<ImageFile> {
        let total = self.store.content_length(bucket, object)?;
        info!(bucket, object, total, "downloading image");
        progress(FetchProgress::Started { total });

        let mut builder = tempfile::Builder::new();
        builder.prefix("dephy-pi-").suffix(".img");
        let mut file = match &self.download_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let written = {
            let mut writer = BufWriter::new(file.as_file_mut());
            let written = self.store.download(bucket, object, &mut writer, &mut |n| {
                progress(FetchProgress::Advanced(n))
            })?;
            writer.flush()?;
            written
        };

        if written != total {
            return Err(fetch_failed(
                bucket,
                object,
                format!("expected {} bytes, received {}", total, written),
            ));
        }
        file.as_file().sync_all()?;
        debug!(path = %file.path().display(), written, "image written to temp file");

        Ok(ImageFile { file, size: written })
    }
}
