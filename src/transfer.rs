//! Transfer worker: moving the bytes of one file to local storage.
//!
//! Bytes are streamed into a hidden temporary file next to the destination
//! (`.<name>~XXXXXX`) while size and MD5 are computed. Only after both check out
//! is the temporary file renamed over the destination. The temporary file is
//! removed on every other path, including the future being dropped on
//! cancellation, so a half-written file never sits at a destination path.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::config::RemoteConfig;
use crate::error::{IntegrityError, TransferError, classify_transfer_status};
use crate::remote::ArchiveClient;
use crate::types::{FileDescriptor, TransferOutcome, Transferred};
use crate::utils::format_bytes;

/// Downloads one file of one item
///
/// Implementations do not consult the completion cache; deciding whether a
/// transfer is needed is the scheduler's job.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `file` of `item` into `destination` and verify it
    async fn fetch(&self, item: &str, file: &FileDescriptor, destination: &Path)
    -> TransferOutcome;
}

/// [`Fetcher`] backed by the remote download endpoint
#[derive(Clone)]
pub struct HttpFetcher {
    client: ArchiveClient,
    file_timeout: Duration,
    stall_timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher using the deadlines from `config`
    pub fn new(client: ArchiveClient, config: &RemoteConfig) -> Self {
        Self {
            client,
            file_timeout: config.file_timeout,
            stall_timeout: config.stall_timeout,
        }
    }

    async fn transfer(
        &self,
        item: &str,
        file: &FileDescriptor,
        destination: &Path,
        started: Instant,
    ) -> TransferOutcome {
        let (parent, name) = match (destination.parent(), destination.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_string_lossy().into_owned()),
            _ => {
                return Err(TransferError::Storage(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid destination {}", destination.display()),
                )));
            }
        };

        tokio::fs::create_dir_all(parent).await?;

        let request = self.client.download_request(item, &file.name);
        let response = tokio::time::timeout(self.stall_timeout, request.send())
            .await
            .map_err(|_| TransferError::Timeout(self.stall_timeout))??;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_transfer_status(status.as_u16()));
        }

        // The temp path deletes itself when dropped; only `persist` keeps it
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}~", name))
            .tempfile_in(parent)?;
        let (std_file, temp_path) = temp.into_parts();
        let mut out = tokio::fs::File::from_std(std_file);

        let mut stream = response.bytes_stream();
        let mut context = md5::Context::new();
        let mut size: u64 = 0;

        loop {
            let next = tokio::time::timeout(self.stall_timeout, stream.next())
                .await
                .map_err(|_| TransferError::Timeout(self.stall_timeout))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            context.consume(&chunk);
            size += chunk.len() as u64;
            out.write_all(&chunk).await?;
        }

        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        let md5 = format!("{:x}", context.compute());
        verify(file, size, &md5)?;

        temp_path.persist(destination).map_err(io::Error::from)?;

        let elapsed = started.elapsed();
        tracing::info!(
            item = %item,
            file = %file.name,
            size = %format_bytes(size),
            elapsed_ms = elapsed.as_millis() as u64,
            "File transferred"
        );

        Ok(Transferred {
            path: destination.to_path_buf(),
            size,
            md5,
            elapsed,
        })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        item: &str,
        file: &FileDescriptor,
        destination: &Path,
    ) -> TransferOutcome {
        tracing::debug!(item = %item, file = %file.name, "Starting transfer");
        let started = Instant::now();

        match tokio::time::timeout(
            self.file_timeout,
            self.transfer(item, file, destination, started),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransferError::Timeout(self.file_timeout)),
        }
    }
}

/// Compare received bytes against the listing; absent expectations always pass
pub fn verify(file: &FileDescriptor, size: u64, md5: &str) -> Result<(), IntegrityError> {
    if let Some(expected) = file.size
        && expected != size
    {
        return Err(IntegrityError::Size {
            expected,
            actual: size,
        });
    }

    if let Some(expected) = &file.md5
        && !expected.eq_ignore_ascii_case(md5)
    {
        return Err(IntegrityError::Checksum {
            expected: expected.clone(),
            actual: md5.to_string(),
        });
    }

    Ok(())
}
