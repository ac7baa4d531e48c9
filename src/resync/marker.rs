//! Resync Marker
//!
//! One-byte file recording whether the buddy needs a resync and whether the
//! coordinator has confirmed that decision yet. The byte is preallocated and
//! always rewritten in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tokio::sync::Mutex;

use crate::error::Result;

/// Marker file name inside the data directory
pub const MARKER_FILE: &str = "buddyneedsresync";

bitflags! {
    /// On-disk marker bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MarkerFlags: u8 {
        /// The decision has not been confirmed by the coordinator
        const UNACKED = 0b01;
        /// The buddy needs a full resync
        const REQUIRED = 0b10;
    }
}

/// Persisted resync decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncState {
    NotRequired,
    NotRequiredUnacked,
    Required,
    RequiredUnacked,
}

impl ResyncState {
    pub fn new(required: bool, unacked: bool) -> Self {
        match (required, unacked) {
            (false, false) => ResyncState::NotRequired,
            (false, true) => ResyncState::NotRequiredUnacked,
            (true, false) => ResyncState::Required,
            (true, true) => ResyncState::RequiredUnacked,
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, ResyncState::Required | ResyncState::RequiredUnacked)
    }

    pub fn is_unacked(self) -> bool {
        matches!(self, ResyncState::NotRequiredUnacked | ResyncState::RequiredUnacked)
    }

    /// Same decision with the unacked bit cleared
    pub fn acked(self) -> Self {
        ResyncState::new(self.is_required(), false)
    }

    pub fn flags(self) -> MarkerFlags {
        let mut flags = MarkerFlags::empty();
        flags.set(MarkerFlags::REQUIRED, self.is_required());
        flags.set(MarkerFlags::UNACKED, self.is_unacked());
        flags
    }

    pub fn from_flags(flags: MarkerFlags) -> Self {
        ResyncState::new(
            flags.contains(MarkerFlags::REQUIRED),
            flags.contains(MarkerFlags::UNACKED),
        )
    }
}

impl std::fmt::Display for ResyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResyncState::NotRequired => write!(f, "NOT_REQUIRED"),
            ResyncState::NotRequiredUnacked => write!(f, "NOT_REQUIRED_UNACKED"),
            ResyncState::Required => write!(f, "REQUIRED"),
            ResyncState::RequiredUnacked => write!(f, "REQUIRED_UNACKED"),
        }
    }
}

/// Durable resync marker of the local node
pub struct ResyncMarker {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResyncMarker {
    /// Open the marker in `data_dir`, creating a `NOT_REQUIRED` one if absent
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(MARKER_FILE);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            write_byte(&mut file, MarkerFlags::empty().bits())?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state; unreadable markers count as `NOT_REQUIRED`
    pub async fn read(&self) -> ResyncState {
        let mut file = self.file.lock().await;
        match read_byte(&mut file) {
            Ok(byte) => ResyncState::from_flags(MarkerFlags::from_bits_truncate(byte)),
            Err(e) => {
                tracing::warn!(
                    "Unable to read resync marker {}: {}",
                    self.path.display(),
                    e
                );
                ResyncState::NotRequired
            }
        }
    }

    /// Persist a state in place
    pub async fn write(&self, state: ResyncState) -> Result<()> {
        let mut file = self.file.lock().await;
        write_byte(&mut file, state.flags().bits())?;
        tracing::debug!("Resync marker set to {}", state);
        Ok(())
    }

    /// Persist a state unless the current one fails `keep`, returns the prior state
    pub async fn replace_if<F>(&self, keep: F, state: ResyncState) -> Result<ResyncState>
    where
        F: FnOnce(ResyncState) -> bool,
    {
        let mut file = self.file.lock().await;
        let current = read_byte(&mut file)
            .map(|byte| ResyncState::from_flags(MarkerFlags::from_bits_truncate(byte)))
            .unwrap_or(ResyncState::NotRequired);

        if keep(current) {
            write_byte(&mut file, state.flags().bits())?;
            tracing::debug!("Resync marker changed {} -> {}", current, state);
        }
        Ok(current)
    }
}

/// Read a marker file without opening it for writing
pub fn read_marker_file(data_dir: &Path) -> ResyncState {
    let path = data_dir.join(MARKER_FILE);
    match File::open(&path).and_then(|mut file| read_byte(&mut file)) {
        Ok(byte) => ResyncState::from_flags(MarkerFlags::from_bits_truncate(byte)),
        Err(_) => ResyncState::NotRequired,
    }
}

fn read_byte(file: &mut File) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn write_byte(file: &mut File, byte: u8) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&[byte])?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_state_flags() {
        for state in [
            ResyncState::NotRequired,
            ResyncState::NotRequiredUnacked,
            ResyncState::Required,
            ResyncState::RequiredUnacked,
        ] {
            assert_eq!(ResyncState::from_flags(state.flags()), state);
        }
        assert_eq!(ResyncState::RequiredUnacked.flags().bits(), 3);
        assert_eq!(ResyncState::RequiredUnacked.acked(), ResyncState::Required);
    }

    #[tokio::test]
    async fn test_marker_persists_in_place() {
        let dir = tempdir().unwrap();

        {
            let marker = ResyncMarker::open(dir.path()).unwrap();
            assert_eq!(marker.read().await, ResyncState::NotRequired);
            marker.write(ResyncState::RequiredUnacked).await.unwrap();
        }

        let len = std::fs::metadata(dir.path().join(MARKER_FILE)).unwrap().len();
        assert_eq!(len, 1);

        let marker = ResyncMarker::open(dir.path()).unwrap();
        assert_eq!(marker.read().await, ResyncState::RequiredUnacked);
        assert_eq!(read_marker_file(dir.path()), ResyncState::RequiredUnacked);
    }

    #[tokio::test]
    async fn test_replace_if() {
        let dir = tempdir().unwrap();
        let marker = ResyncMarker::open(dir.path()).unwrap();
        marker.write(ResyncState::RequiredUnacked).await.unwrap();

        let prior = marker
            .replace_if(|s| s.is_unacked(), ResyncState::Required)
            .await
            .unwrap();
        assert_eq!(prior, ResyncState::RequiredUnacked);
        assert_eq!(marker.read().await, ResyncState::Required);

        marker
            .replace_if(|s| s.is_unacked(), ResyncState::NotRequired)
            .await
            .unwrap();
        assert_eq!(marker.read().await, ResyncState::Required);
    }

    #[test]
    fn test_missing_marker_is_not_required() {
        let dir = tempdir().unwrap();
        assert_eq!(read_marker_file(dir.path()), ResyncState::NotRequired);
    }
}
