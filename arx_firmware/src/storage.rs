//! Nonvolatile storage: the key/value configuration blob and the persisted
//! joint positions.
//!
//! Storage is modeled as a fixed-size byte image (erased = 0xFF) behind the
//! [`Nvs`] trait, with a file-backed implementation for the target and an
//! in-memory one for tests. Two disjoint regions:
//!
//! 1. `CFG_BLOB_ADDR..+CFG_BLOB_SIZE` — a JSON document of
//!    `joint<N>.<param>` float parameters. A fully erased region is
//!    interpreted as "factory defaults" and triggers a write-back.
//! 2. `JOINT_POS_ADDR..` — six little-endian IEEE-754 f32 joint positions
//!    [deg], written on the moving→idle transition and on restart.
//!
//! Parameter writes are debounced: the store flushes after a quiet period
//! so a burst of tuning commands costs one erase/write cycle.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use arx_common::consts::{CFG_BLOB_ADDR, CFG_BLOB_SIZE, JOINT_COUNT, JOINT_POS_ADDR, NVS_SIZE};
use arx_common::joint::Tunable;

/// Quiet period before a dirty parameter set is flushed.
pub const WRITEBACK_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config blob exceeds {CFG_BLOB_SIZE} bytes ({0} needed)")]
    BlobTooLarge(usize),
    #[error("region out of bounds: {addr}+{len} > {size}")]
    OutOfBounds { addr: usize, len: usize, size: usize },
    #[error("config blob serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ─── Nvs backends ───────────────────────────────────────────────────

/// A fixed-size nonvolatile byte image.
pub trait Nvs: Send {
    fn size(&self) -> usize;
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), StorageError>;
}

fn check_bounds(addr: usize, len: usize, size: usize) -> Result<(), StorageError> {
    if addr + len > size {
        return Err(StorageError::OutOfBounds { addr, len, size });
    }
    Ok(())
}

/// Volatile in-memory image (tests, bench runs).
///
/// Clones share the image, so "reboots" can be simulated by reopening a
/// store over a clone.
#[derive(Clone)]
pub struct MemNvs {
    image: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MemNvs {
    /// A fully erased image of the standard size.
    pub fn new() -> Self {
        Self {
            image: std::sync::Arc::new(std::sync::Mutex::new(vec![0xFF; NVS_SIZE])),
        }
    }

    fn image(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.image
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemNvs {
    fn default() -> Self {
        Self::new()
    }
}

impl Nvs for MemNvs {
    fn size(&self) -> usize {
        self.image().len()
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let image = self.image();
        check_bounds(addr, buf.len(), image.len())?;
        buf.copy_from_slice(&image[addr..addr + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), StorageError> {
        let mut image = self.image();
        check_bounds(addr, data.len(), image.len())?;
        image[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// File-backed image; created fully erased when absent or undersized.
pub struct FileNvs {
    file: File,
}

impl FileNvs {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < NVS_SIZE {
            file.seek(SeekFrom::Start(len as u64))?;
            let pad = vec![0xFF; NVS_SIZE - len];
            file.write_all(&pad)?;
            file.flush()?;
            info!(path = %path.display(), "initialized storage image");
        }
        Ok(Self { file })
    }
}

impl Nvs for FileNvs {
    fn size(&self) -> usize {
        NVS_SIZE
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(addr, buf.len(), NVS_SIZE)?;
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(addr, data.len(), NVS_SIZE)?;
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }
}

// ─── Config store ───────────────────────────────────────────────────

/// The persisted key/value parameter document plus the joint-position
/// region, with debounced write-back.
pub struct ConfigStore {
    nvs: Box<dyn Nvs>,
    doc: BTreeMap<String, f64>,
    dirty_since: Option<Instant>,
}

impl ConfigStore {
    /// Load the store, falling back to factory defaults when the blob
    /// region is erased or unreadable.
    pub fn open(nvs: Box<dyn Nvs>) -> Result<Self, StorageError> {
        let mut store = Self {
            nvs,
            doc: BTreeMap::new(),
            dirty_since: None,
        };

        let mut blob = vec![0u8; CFG_BLOB_SIZE];
        store.nvs.read(CFG_BLOB_ADDR, &mut blob)?;

        if blob.iter().all(|&b| b == 0xFF) {
            info!("storage erased, writing factory defaults");
            store.reset_defaults();
            store.save()?;
        } else {
            let end = blob.iter().position(|&b| b == 0xFF).unwrap_or(blob.len());
            match serde_json::from_slice::<BTreeMap<String, f64>>(&blob[..end]) {
                Ok(doc) => store.doc = doc,
                Err(e) => {
                    warn!(error = %e, "config blob unreadable, restoring defaults");
                    store.reset_defaults();
                    store.save()?;
                }
            }
        }
        Ok(store)
    }

    /// Replace the document with the factory default table.
    pub fn reset_defaults(&mut self) {
        self.doc.clear();
        for joint in 0..JOINT_COUNT {
            for tunable in Tunable::ALL {
                self.doc.insert(tunable.key(joint), tunable.default_for(joint));
            }
        }
        self.dirty_since = Some(Instant::now());
    }

    /// Read a parameter, falling back to `default` for an absent key.
    pub fn get(&self, key: &str, default: f64) -> f64 {
        self.doc.get(key).copied().unwrap_or(default)
    }

    /// Read a typed per-joint tunable with its factory default.
    pub fn tunable(&self, joint: usize, tunable: Tunable) -> f64 {
        self.get(&tunable.key(joint), tunable.default_for(joint))
    }

    /// Write a parameter; persisted by the next debounced flush.
    pub fn set(&mut self, key: &str, value: f64) {
        self.doc.insert(key.to_string(), value);
        self.dirty_since = Some(Instant::now());
    }

    /// Write a typed per-joint tunable.
    pub fn set_tunable(&mut self, joint: usize, tunable: Tunable, value: f64) {
        self.set(&tunable.key(joint), value);
    }

    /// The full parameter document.
    pub fn snapshot(&self) -> &BTreeMap<String, f64> {
        &self.doc
    }

    /// Serialize the document into the blob region, padded with 0xFF.
    pub fn save(&mut self) -> Result<(), StorageError> {
        let json = serde_json::to_vec(&self.doc)?;
        if json.len() > CFG_BLOB_SIZE {
            return Err(StorageError::BlobTooLarge(json.len()));
        }
        let mut blob = vec![0xFF; CFG_BLOB_SIZE];
        blob[..json.len()].copy_from_slice(&json);
        self.nvs.write(CFG_BLOB_ADDR, &blob)?;
        self.dirty_since = None;
        Ok(())
    }

    /// Debounced write-back, run from the main loop. Failures are logged;
    /// a retry happens on the next quiet period.
    pub fn update(&mut self, now: Instant) {
        if let Some(since) = self.dirty_since {
            if now.duration_since(since) >= WRITEBACK_DELAY {
                if let Err(e) = self.save() {
                    warn!(error = %e, "config write-back failed");
                    self.dirty_since = Some(now);
                }
            }
        }
    }

    /// Whether unsaved parameter writes are pending.
    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    // ── Joint positions ─────────────────────────────────────────────

    /// Persist all joint positions [deg] as little-endian f32.
    pub fn save_joint_positions(&mut self, positions: &[f64; JOINT_COUNT]) -> Result<(), StorageError> {
        let mut buf = [0u8; JOINT_COUNT * 4];
        for (i, pos) in positions.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&(*pos as f32).to_le_bytes());
        }
        self.nvs.write(JOINT_POS_ADDR, &buf)
    }

    /// Restore joint positions; erased or non-finite entries read as zero.
    pub fn load_joint_positions(&mut self) -> Result<[f64; JOINT_COUNT], StorageError> {
        let mut buf = [0u8; JOINT_COUNT * 4];
        self.nvs.read(JOINT_POS_ADDR, &mut buf)?;
        let mut out = [0.0; JOINT_COUNT];
        for (i, slot) in out.iter_mut().enumerate() {
            let bytes: [u8; 4] = buf[i * 4..i * 4 + 4].try_into().unwrap_or([0xFF; 4]);
            if bytes == [0xFF; 4] {
                continue;
            }
            let v = f32::from_le_bytes(bytes);
            if v.is_finite() {
                *slot = f64::from(v);
            }
        }
        Ok(out)
    }
}
