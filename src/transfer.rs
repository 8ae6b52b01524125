use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use uuid::Uuid;

use crate::{
    error::{Result, TelekinesisError},
    models::{percent, FileMetadata},
    mux::MuxSender,
};

/// Name used when the peer sends nothing usable as a file name.
const FALLBACK_NAME: &str = "received_file";
const PART_SUFFIX: &str = "part";

#[derive(Debug)]
pub enum TransferUpdate {
    /// Outbound only: metadata is known and has been announced to the peer.
    Started { filename: String, total_bytes: u64 },
    /// Cumulative bytes moved so far.
    Progress(u64),
    /// `Some(path)` for a committed inbound file.
    Finished(Result<Option<PathBuf>>),
}

pub type TransferUpdates = mpsc::UnboundedSender<(Uuid, TransferUpdate)>;

fn report(updates: &TransferUpdates, id: Uuid, update: TransferUpdate) {
    if updates.send((id, update)).is_err() {
        debug!("session manager went away, dropping update for transfer {id}");
    }
}

/// A file queued for sending. Files staged from a control API upload are
/// temporary and get deleted once the transfer is over, however it ends.
#[derive(Debug)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub filename: String,
    temporary: bool,
}

impl OutgoingFile {
    pub fn new(path: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filename: filename.into(),
            temporary: false,
        }
    }

    pub fn staged(path: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filename: filename.into(),
            temporary: true,
        }
    }
}

impl Drop for OutgoingFile {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("could not remove staged upload {:?}: {e}", self.path);
            }
        }
    }
}

/// Streams `file` to the peer and reports back on `updates`. Runs as its own
/// task so the session manager can abort it at any chunk boundary.
pub async fn send_file(
    id: Uuid,
    file: OutgoingFile,
    chunk_size: u32,
    mux: MuxSender,
    updates: TransferUpdates,
) {
    let result = stream_file(id, &file, chunk_size, &mux, &updates).await;
    if let Err(e) = &result {
        warn!("sending {} failed: {e}", file.filename);
    }
    report(&updates, id, TransferUpdate::Finished(result.map(|_| None)));
}

async fn stream_file(
    id: Uuid,
    file: &OutgoingFile,
    chunk_size: u32,
    mux: &MuxSender,
    updates: &TransferUpdates,
) -> Result<()> {
    let chunk_size = chunk_size.max(1);
    let path = file.path.clone();
    let name = file.filename.clone();
    let meta = tokio::task::spawn_blocking(move || {
        FileMetadata::from_path(id, &path, &name, chunk_size)
    })
    .await??;

    mux.send_metadata(&meta).await?;
    report(
        updates,
        id,
        TransferUpdate::Started {
            filename: meta.file_name.clone(),
            total_bytes: meta.size,
        },
    );
    info!(
        "sending {} ({} bytes in {} chunks)",
        meta.file_name, meta.size, meta.total_chunks
    );

    let mut reader = File::open(&file.path).await?;
    let mut buf = vec![0u8; chunk_size as usize];
    let mut sent = 0u64;
    while sent < meta.size {
        let want = (meta.size - sent).min(u64::from(chunk_size)) as usize;
        reader.read_exact(&mut buf[..want]).await?;
        mux.send_chunk(Bytes::copy_from_slice(&buf[..want])).await?;
        sent += want as u64;
        report(updates, id, TransferUpdate::Progress(sent));
    }

    Ok(())
}

/// Receives the chunks of one announced file and commits it to `dir`.
/// Chunks arrive over a bounded channel so disk writes never hold up the
/// frame reader.
pub async fn receive_file(
    meta: FileMetadata,
    dir: PathBuf,
    mut chunks: mpsc::Receiver<Bytes>,
    updates: TransferUpdates,
) {
    let id = meta.id;
    let result = write_file(&meta, &dir, &mut chunks, &updates).await;
    if let Err(e) = &result {
        warn!("receiving {} failed: {e}", meta.file_name);
    }
    report(&updates, id, TransferUpdate::Finished(result.map(Some)));
}

async fn write_file(
    meta: &FileMetadata,
    dir: &Path,
    chunks: &mut mpsc::Receiver<Bytes>,
    updates: &TransferUpdates,
) -> Result<PathBuf> {
    let mut part = PartialFile::create(dir, &meta.file_name, meta.size, meta.sha256.clone()).await?;
    while part.written() < meta.size {
        let Some(chunk) = chunks.recv().await else {
            return Err(TelekinesisError::Transport(format!(
                "{} ended after {} of {} bytes",
                meta.file_name,
                part.written(),
                meta.size
            )));
        };
        part.write(&chunk).await?;
        report(updates, meta.id, TransferUpdate::Progress(part.written()));
    }
    part.commit().await
}

/// An inbound file being written next to its final location. Until
/// [`PartialFile::commit`] succeeds the data lives in `<name>.<id>.part`, which is
/// removed again if the value is dropped.
#[derive(Debug)]
pub struct PartialFile {
    dir: PathBuf,
    file_name: String,
    part_path: PathBuf,
    file: Option<File>,
    written: u64,
    expected: u64,
    sha256: Option<String>,
    committed: bool,
}

impl PartialFile {
    pub async fn create(
        dir: &Path,
        file_name: &str,
        expected: u64,
        sha256: Option<String>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TelekinesisError::storage("could not create download directory", e))?;

        let file_name = sanitize_filename(file_name);
        // fresh name per transfer, never an existing file
        let part_path = dir.join(format!(
            "{file_name}.{}.{PART_SUFFIX}",
            Uuid::new_v4().simple()
        ));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
            .map_err(|e| TelekinesisError::storage("could not open write handle", e))?;
        debug!("writing {file_name} to {part_path:?}");

        Ok(Self {
            dir: dir.to_path_buf(),
            file_name,
            part_path,
            file: Some(file),
            written: 0,
            expected,
            sha256,
            committed: false,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let len = chunk.len() as u64;
        if self.written + len > self.expected {
            return Err(TelekinesisError::Protocol(format!(
                "chunk overflows {}: {} + {len} > {} bytes",
                self.file_name, self.written, self.expected
            )));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TelekinesisError::Storage("write handle already closed".into()))?;
        file.write_all(chunk)
            .await
            .map_err(|e| TelekinesisError::storage("could not write chunk", e))?;
        self.written += len;
        Ok(())
    }

    /// Flushes, verifies and moves the file to a free name in the download
    /// directory. Returns the final path.
    pub async fn commit(mut self) -> Result<PathBuf> {
        if self.written != self.expected {
            return Err(TelekinesisError::Storage(format!(
                "{} is incomplete: {} of {} bytes",
                self.file_name, self.written, self.expected
            )));
        }

        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| TelekinesisError::storage("could not flush", e))?;
            file.sync_all()
                .await
                .map_err(|e| TelekinesisError::storage("could not sync", e))?;
        }

        if let Some(expected) = self.sha256.clone() {
            let path = self.part_path.clone();
            let actual = tokio::task::spawn_blocking(move || sha256::try_digest(path.as_path())).await??;
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(TelekinesisError::Storage(format!(
                    "{} failed integrity check",
                    self.file_name
                )));
            }
        }

        let target = unique_path(&self.dir, &self.file_name).await?;
        tokio::fs::rename(&self.part_path, &target)
            .await
            .map_err(|e| TelekinesisError::storage("could not move file into place", e))?;
        self.committed = true;
        info!("saved {} to {target:?}", self.file_name);
        Ok(target)
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // close the handle before unlinking
        drop(self.file.take());
        match std::fs::remove_file(&self.part_path) {
            Ok(()) => debug!("discarded partial file {:?}", self.part_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove partial file {:?}: {e}", self.part_path),
        }
    }
}

/// Reduces a peer-supplied name to one harmless path component.
pub fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.trim() {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        name => name.to_string(),
    }
}

/// `dir/name`, or `dir/stem_N.ext` with the first free `N` if taken.
pub async fn unique_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = as_path.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 1u32.. {
        let numbered = match &ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        let candidate = dir.join(numbered);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(TelekinesisError::Storage(format!("no free name for {name}")))
}

/// Rate limits progress reports: the first observation always passes, later
/// ones at most once per interval, and completion exactly once.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
    finished: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            finished: false,
        }
    }

    pub fn observe(&mut self, moved: u64, total: u64) -> Option<f64> {
        if self.finished {
            return None;
        }
        let progress = percent(moved, total);
        if progress >= 100.0 {
            self.finished = true;
            return Some(100.0);
        }
        let now = Instant::now();
        match self.last {
            Some(at) if now.duration_since(at) < self.interval => None,
            _ => {
                self.last = Some(now);
                Some(progress)
            }
        }
    }
}
