//! Serial number allocation for issued certificates.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Serial reserved for the self-signed root.
pub const ROOT_SERIAL: u64 = 1;

/// Strictly increasing serial source shared by every issuance call of one CA.
///
/// The counter is guarded by a mutex. When backed by a state file, the new
/// high-water mark is written before the lock is released, so a reopened CA
/// never hands out a serial twice.
#[derive(Debug)]
pub struct SerialAllocator {
    last: Mutex<u64>,
    state_file: Option<PathBuf>,
}

impl SerialAllocator {
    /// In-memory allocator; the first serial returned is `ROOT_SERIAL + 1`.
    pub fn new() -> Self {
        Self {
            last: Mutex::new(ROOT_SERIAL),
            state_file: None,
        }
    }

    /// Allocator resuming after the serial recorded in `path`.
    ///
    /// A missing file starts from the root serial.
    pub fn persistent(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let last = match fs::read_to_string(&path) {
            Ok(content) => content.trim().parse::<u64>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt serial state in {:?}: {}", path, e),
                )
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ROOT_SERIAL,
            Err(e) => return Err(e),
        };

        debug!("Serial allocator resuming after {} ({:?})", last, path);

        Ok(Self {
            last: Mutex::new(last.max(ROOT_SERIAL)),
            state_file: Some(path),
        })
    }

    /// Next serial number, greater than any previously returned one.
    pub fn next(&self) -> io::Result<u64> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = last
            .checked_add(1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "serial space exhausted"))?;

        if let Some(path) = &self.state_file {
            write_state(path, next)?;
        }

        *last = next;
        Ok(next)
    }

    /// Last serial handed out (the root serial if none yet).
    pub fn last(&self) -> u64 {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn write_state(path: &Path, value: u64) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, value.to_string())?;
    fs::rename(&tmp, path)
}
