//! Append-only control-plane journal for failure records.
//!
//! The in-memory repository is rebuilt from this journal on restart; an
//! external self-durable backend uses [`NullJournal`]. Frames are
//! `[u32 len][u32 crc32][json payload]`, and replay tolerates a torn tail
//! from a crash mid-append.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;

use crate::record::FailureRecord;

/// Sink for failure-record mutations. Every repository mutation is appended
/// before it becomes visible to readers.
pub trait Journal: Send + Sync {
    fn append(&self, record: &FailureRecord) -> anyhow::Result<()>;
}

/// Journal that drops everything; for tests and self-durable backends.
#[derive(Debug, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn append(&self, _record: &FailureRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// File-backed journal. Appends are synced before returning so a replayed
/// repository never trails an acknowledged mutation.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    /// Open (or create) a journal file and replay its entries in append
    /// order. The caller applies the returned records last-writer-wins.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<(Self, Vec<FailureRecord>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create journal dir")?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open journal {}", path.display()))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).context("read journal")?;
        let records = replay_frames(&raw, &path);

        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&self, record: &FailureRecord) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(record).context("encode journal record")?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(&frame).context("append journal frame")?;
        file.sync_data().context("sync journal")?;
        Ok(())
    }
}

/// Decode frames until the buffer ends or a frame fails to parse. A short or
/// corrupt tail frame ends replay; everything before it is kept.
fn replay_frames(raw: &[u8], path: &Path) -> Vec<FailureRecord> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while raw.len() - offset >= 8 {
        let len = u32::from_le_bytes([
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            raw[offset + 4],
            raw[offset + 5],
            raw[offset + 6],
            raw[offset + 7],
        ]);
        let start = offset + 8;
        let Some(end) = start.checked_add(len).filter(|end| *end <= raw.len()) else {
            break;
        };
        let payload = &raw[start..end];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            break;
        }
        match serde_json::from_slice::<FailureRecord>(payload) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(
                    journal = %path.display(),
                    offset,
                    error = %err,
                    "undecodable journal frame, stopping replay"
                );
                break;
            }
        }
        offset = end;
    }
    if offset < raw.len() {
        tracing::warn!(
            journal = %path.display(),
            dropped_bytes = raw.len() - offset,
            "ignoring torn journal tail"
        );
    }
    records
}
