//! Streaming ZIP archive of a transfer.
//!
//! The archive is produced entry by entry into a bounded in-process pipe
//! that feeds the response body. At most one copy buffer of file data is
//! held per archive, whatever the transfer size.

use async_zip::{
    Compression, DeflateOption, ZipEntryBuilder, error::ZipError, tokio::write::ZipFileWriter,
};
use bytes::Bytes;
use futures::{
    AsyncWriteExt as _, StreamExt,
    future,
    stream::{self, BoxStream},
};
use std::{io, path::Path};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::oneshot,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    errors::{TransferError, TransferResult},
    models::transfer::{FileDescriptor, TransferId},
    services::directory::TransferDirectory,
};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry name inside the zip: the file's relative path.
    pub name: String,
    pub key: String,
}

/// Everything decided before the first byte goes out.
#[derive(Debug, Clone)]
pub struct ArchivePlan {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub entries: Vec<ArchiveEntry>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries_written: usize,
    /// Files that could not be opened and have no entry.
    pub skipped: Vec<String>,
    /// Files whose read failed part way; their entry is truncated.
    pub truncated: Vec<String>,
    pub bytes_read: u64,
}

/// Download name for an archive of `files`.
pub fn archive_file_name(id: &TransferId, files: &[FileDescriptor]) -> String {
    let stem = files.first().and_then(|first| {
        Path::new(&first.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
    });
    match stem {
        Some(stem) if files.len() == 1 => format!("{stem}.zip"),
        Some(stem) => format!("{stem} - Bulk Transfer.zip"),
        None => format!("transfer-{id}.zip"),
    }
}

fn zip_aborted(err: ZipError) -> TransferError {
    TransferError::StreamAborted(io::Error::other(err.to_string()))
}

#[derive(Clone)]
pub struct ArchiveBuilder {
    directory: TransferDirectory,
}

impl ArchiveBuilder {
    pub fn new(directory: TransferDirectory) -> Self {
        Self { directory }
    }

    /// Gate, list and name the archive. Every failure here happens before
    /// any output, so callers can still answer with a clean error.
    pub async fn prepare(
        &self,
        id: &TransferId,
        password: Option<&str>,
    ) -> TransferResult<ArchivePlan> {
        let listing = self.directory.list_files(id, password).await?;
        if listing.files.is_empty() {
            return Err(TransferError::NotFound("No files found in transfer".into()));
        }
        let file_name = archive_file_name(id, &listing.files);
        let entries = listing
            .files
            .into_iter()
            .map(|file| ArchiveEntry {
                key: id.object_key(&file.name),
                name: file.name,
            })
            .collect();
        Ok(ArchivePlan {
            transfer_id: id.clone(),
            file_name,
            entries,
        })
    }

    /// Write the archive for `plan` into `sink`, in plan order, then shut
    /// the sink down.
    ///
    /// A file that cannot be opened is skipped and a read error part way
    /// through a file ends that entry; both only log. A truncated entry's
    /// CRC and size cover only the bytes that were read, so unzip tools
    /// accept it without complaint; callers learn about it from
    /// [`ArchiveSummary::truncated`]. Any error writing to
    /// `sink` or from the compressor aborts with
    /// [`TransferError::StreamAborted`].
    pub async fn write<W>(&self, plan: &ArchivePlan, sink: W) -> TransferResult<ArchiveSummary>
    where
        W: AsyncWrite + Unpin,
    {
        let store = self.directory.store();
        let mut summary = ArchiveSummary::default();
        let mut zip = ZipFileWriter::with_tokio(sink);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        for entry in &plan.entries {
            let mut reader = match store.fetch_stream(&entry.key).await {
                Ok(reader) => reader,
                Err(err) => {
                    warn!(
                        transfer_id = %plan.transfer_id,
                        key = %entry.key,
                        error = %err,
                        "skipping archive entry that could not be opened"
                    );
                    summary.skipped.push(entry.name.clone());
                    continue;
                }
            };

            let builder = ZipEntryBuilder::new(entry.name.clone().into(), Compression::Deflate)
                .deflate_option(DeflateOption::Maximum);
            let mut writer = zip.write_entry_stream(builder).await.map_err(zip_aborted)?;
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        warn!(
                            transfer_id = %plan.transfer_id,
                            key = %entry.key,
                            error = %err,
                            "archive entry read failed; entry truncated"
                        );
                        summary.truncated.push(entry.name.clone());
                        break;
                    }
                };
                writer
                    .write_all(&buf[..n])
                    .await
                    .map_err(TransferError::StreamAborted)?;
                summary.bytes_read += n as u64;
            }
            writer.close().await.map_err(zip_aborted)?;
            summary.entries_written += 1;
            debug!(transfer_id = %plan.transfer_id, entry = %entry.name, "archived entry");
        }

        let mut sink = zip.close().await.map_err(zip_aborted)?.into_inner();
        sink.shutdown().await.map_err(TransferError::StreamAborted)?;
        Ok(summary)
    }

    /// Run `plan` on a background task and expose the archive as a byte
    /// stream. If the archive cannot be completed the stream ends with an
    /// error instead of a clean EOF, so a truncated zip is never presented
    /// as finished.
    pub fn stream_plan(&self, plan: ArchivePlan) -> BoxStream<'static, io::Result<Bytes>> {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel::<Result<(), String>>();
        let builder = self.clone();

        tokio::spawn(async move {
            let outcome = match builder.write(&plan, writer).await {
                Ok(summary) => {
                    builder
                        .directory
                        .bandwidth()
                        .record(summary.bytes_read)
                        .await;
                    info!(
                        transfer_id = %plan.transfer_id,
                        entries = summary.entries_written,
                        skipped = summary.skipped.len(),
                        truncated = summary.truncated.len(),
                        bytes = summary.bytes_read,
                        "archive streamed"
                    );
                    Ok(())
                }
                Err(err) => {
                    warn!(transfer_id = %plan.transfer_id, error = %err, "archive stream aborted");
                    Err(err.to_string())
                }
            };
            let _ = done_tx.send(outcome);
        });

        let trailer = stream::once(async move {
            match done_rx.await {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(Err(io::Error::other(message))),
                Err(_) => Some(Err(io::Error::other("archive task ended unexpectedly"))),
            }
        })
        .filter_map(future::ready);

        ReaderStream::with_capacity(reader, PIPE_CAPACITY)
            .chain(trailer)
            .boxed()
    }
}
