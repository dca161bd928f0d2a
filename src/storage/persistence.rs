use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::StorageError;
use crate::measurement::StoredResult;

const LOG_FILE: &str = "results.log";

/// Append-only log of stored results for crash recovery.
///
/// Every append writes one frame (4-byte big-endian length, then a JSON
/// array of results) and syncs it before returning, so a header and its
/// details are either replayed together or not at all.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResultLog {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(ResultLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame holding `results`.
    pub fn append(&self, results: &[StoredResult]) -> Result<(), StorageError> {
        let serialized = serde_json::to_vec(results)?;
        let frame_len = u32::try_from(serialized.len()).map_err(|_| {
            StorageError::Serialization(format!("frame of {} bytes is too large", serialized.len()))
        })?;

        let mut frame = Vec::with_capacity(4 + serialized.len());
        frame.extend_from_slice(&frame_len.to_be_bytes());
        frame.extend_from_slice(&serialized);

        let mut file = self.file.lock().map_err(|_| StorageError::LockPoisoned)?;
        file.write_all(&frame)?;
        file.sync_data()?;

        debug!(results = results.len(), bytes = frame.len(), "appended result frame");
        Ok(())
    }

    /// Read back every complete frame.
    ///
    /// A torn or unparseable frame at the tail (crash during append) is
    /// dropped with a warning and the file is cut back to the last complete
    /// frame, so later appends start on a frame boundary. Anything unreadable
    /// before the tail is an error.
    pub fn replay(&self) -> Result<Vec<StoredResult>, StorageError> {
        let mut file = self.file.lock().map_err(|_| StorageError::LockPoisoned)?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;

        let mut results = Vec::new();
        let mut offset = 0u64;
        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < 4 {
                break;
            }

            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf)?;
            let frame_len = u64::from(u32::from_be_bytes(len_buf));
            if frame_len > remaining - 4 {
                break;
            }

            let mut frame = vec![0u8; frame_len as usize];
            file.read_exact(&mut frame)?;
            let frame_end = offset + 4 + frame_len;

            match serde_json::from_slice::<Vec<StoredResult>>(&frame) {
                Ok(batch) => results.extend(batch),
                Err(_) if frame_end == file_len => break,
                Err(e) => return Err(e.into()),
            }
            offset = frame_end;
        }

        if offset < file_len {
            warn!(
                path = %self.path.display(),
                kept = offset,
                dropped = file_len - offset,
                "truncating incomplete frame at end of result log"
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }

        file.seek(SeekFrom::End(0))?;
        Ok(results)
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        let file = self.file.lock().map_err(|_| StorageError::LockPoisoned)?;
        file.sync_all()?;
        Ok(())
    }
}
