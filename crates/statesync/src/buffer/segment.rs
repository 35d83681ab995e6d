//! On-disk layout of a buffer directory.
//!
//! ```text
//! <storage_path>/<name>/
//!     00000000000000000001.seg   JSON lines, one BufferedRecord each
//!     00000000000000010001.seg   named after the first seq it holds
//!     checkpoint                 highest committed seq, decimal
//! ```
//!
//! Segments are append-only. A crash mid-append can leave a torn final line
//! in the newest segment; replay truncates it. A failed append is rolled
//! back in place; if even that fails the writer is abandoned, so the
//! fragment ends up as the unterminated last line of a sealed segment and
//! is truncated the same way. Any other damaged line is reported as
//! corruption rather than silently skipped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::BufferedRecord;
use crate::error::BufferError;

const SEGMENT_EXT: &str = "seg";
const CHECKPOINT_FILE: &str = "checkpoint";
const CHECKPOINT_TMP: &str = "checkpoint.tmp";

pub(crate) fn segment_path(dir: &Path, first_seq: u64) -> PathBuf {
    dir.join(format!("{first_seq:020}.{SEGMENT_EXT}"))
}

/// Segment files in the directory, ordered by first seq.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        let first_seq = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        match first_seq {
            Some(seq) => segments.push((seq, path)),
            None => warn!(path = %path.display(), "ignoring unrecognized segment file"),
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Highest committed seq, `0` when nothing was ever committed.
pub(crate) fn read_checkpoint(dir: &Path) -> Result<u64, BufferError> {
    let path = dir.join(CHECKPOINT_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    raw.trim().parse::<u64>().map_err(|e| BufferError::Corrupt {
        path,
        line: 1,
        reason: format!("invalid checkpoint: {e}"),
    })
}

/// Atomically replace the checkpoint (write temp, fsync, rename).
pub(crate) fn write_checkpoint(dir: &Path, seq: u64) -> Result<(), BufferError> {
    let tmp = dir.join(CHECKPOINT_TMP);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(seq.to_string().as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(CHECKPOINT_FILE))?;
    Ok(())
}

/// Read every record of a segment.
///
/// With `tail == true` (the newest segment) an unparseable final line is
/// treated as a torn write and truncated away. In older segments only an
/// unterminated final line counts as torn.
pub(crate) fn replay_segment(path: &Path, tail: bool) -> Result<Vec<BufferedRecord>, BufferError> {
    let bytes = fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let (line, next, terminated) = match bytes[offset..].iter().position(|b| *b == b'\n') {
            Some(pos) => (&bytes[offset..offset + pos], offset + pos + 1, true),
            None => (&bytes[offset..], bytes.len(), false),
        };
        let is_last = next >= bytes.len();

        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }

        match serde_json::from_slice::<BufferedRecord>(line) {
            Ok(record) => {
                records.push(record);
                if !terminated {
                    // Record landed but its newline did not.
                    OpenOptions::new().append(true).open(path)?.write_all(b"\n")?;
                }
            }
            Err(e) if is_last && (tail || !terminated) => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %e,
                    "truncating torn record at end of segment"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(offset as u64)?;
                file.sync_all()?;
            }
            Err(e) => {
                return Err(BufferError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: e.to_string(),
                })
            }
        }
        offset = next;
    }

    Ok(records)
}

/// Append handle for the active segment.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    file: File,
    path: PathBuf,
    pub(crate) first_seq: u64,
    pub(crate) last_seq: u64,
    pub(crate) records: usize,
    /// A failed append could not be rolled back; stop writing here.
    pub(crate) damaged: bool,
}

impl SegmentWriter {
    /// Create (or reopen) the segment starting at `first_seq`.
    pub(crate) fn open(dir: &Path, first_seq: u64) -> Result<Self, BufferError> {
        let path = segment_path(dir, first_seq);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file,
            path,
            first_seq,
            last_seq: first_seq.saturating_sub(1),
            records: 0,
            damaged: false,
        })
    }

    /// Reopen an existing segment that already holds records.
    pub(crate) fn resume(
        dir: &Path,
        first_seq: u64,
        last_seq: u64,
        records: usize,
    ) -> Result<Self, BufferError> {
        let mut writer = Self::open(dir, first_seq)?;
        writer.last_seq = last_seq;
        writer.records = records;
        Ok(writer)
    }

    /// Append one record. On failure nothing of it is left in the file,
    /// or the writer is marked [`damaged`](Self::damaged).
    pub(crate) fn append(&mut self, record: &BufferedRecord, sync: bool) -> Result<(), BufferError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let start = self.file.metadata()?.len();
        let written = self.file.write_all(&line).and_then(|()| {
            if sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            self.rewind(start);
            return Err(e.into());
        }

        self.last_seq = record.seq;
        self.records += 1;
        Ok(())
    }

    /// Cut the file back to `len` bytes after a partial write.
    fn rewind(&mut self, len: u64) {
        if let Err(e) = self.file.set_len(len) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "could not roll back failed append, abandoning segment"
            );
            self.damaged = true;
        }
    }

    /// Second handle to the segment file, for an fsync outside the queue lock.
    pub(crate) fn try_clone_file(&self) -> Result<File, BufferError> {
        Ok(self.file.try_clone()?)
    }

    pub(crate) fn sync(&self) -> Result<(), BufferError> {
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
