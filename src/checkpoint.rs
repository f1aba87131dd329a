//! Checkpoint records, storage and background writes.
//!
//! A full record is one safetensors blob. Tensors are namespaced by role:
//!
//! | Prefix               | Contents                       |
//! |----------------------|--------------------------------|
//! | `model.`             | live parameters                |
//! | `ema.`               | shadow parameters              |
//! | `optim.exp_avg.`     | AdamW first moments            |
//! | `optim.exp_avg_sq.`  | AdamW second moments           |
//!
//! The header metadata carries the `format` marker, the format `version`,
//! the step counters as JSON under `state`, the per-parameter AdamW counters
//! as JSON under `optim_steps` and a `saved_at` timestamp.
//!
//! Anything without the marker is a legacy weights-only record whose tensors
//! are the shadow (inference) weights. When such a record nests several
//! sub-dicts (`model.*`, `ema.*`, `opt.*`), only the `ema.` entries are used.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::coordinator::OptimizerCoordinator;
use crate::ema::EmaShadow;
use crate::error::{LatteError, Result};
use crate::optimizer::AdamWState;
use crate::params::{LoadReport, ParameterSet};
use crate::scheduler::SchedulerState;

/// Value of the `format` metadata entry on full records.
pub const FULL_FORMAT: &str = "latte-train-full";

/// Current full-record version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Key of the checkpoint written when training ends or is cancelled.
pub const FINAL_CHECKPOINT: &str = "checkpoint-final.safetensors";

const LIVE_PREFIX: &str = "model.";
const SHADOW_PREFIX: &str = "ema.";
const EXP_AVG_PREFIX: &str = "optim.exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "optim.exp_avg_sq.";

/// Storage key for the periodic checkpoint at `step`.
#[must_use]
pub fn checkpoint_key(step: u64) -> String {
    format!("checkpoint-{step:07}.safetensors")
}

/// Byte store for checkpoint blobs.
///
/// Every method returns an error when the underlying store fails or, for
/// `read`, when `key` does not exist.
pub trait CheckpointStorage: Send + Sync {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn read(&self, key: &str) -> Result<Vec<u8>>;
    fn exists(&self, key: &str) -> Result<bool>;
}

/// Checkpoints as files under a root directory.
///
/// Writes go to a temporary file that is renamed into place, so a reader
/// never sees a partial blob. Temporary names carry the process id and a
/// per-process counter, so concurrent writers of one key do not share one.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Use `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl CheckpointStorage for FsStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        static WRITES: AtomicU64 = AtomicU64::new(0);

        let path = self.path_for(key);
        let n = WRITES.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .root
            .join(format!(".{key}.{}.{n}.tmp", std::process::id()));
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        std::fs::read(&path).map_err(|e| {
            LatteError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).is_file())
    }
}

/// In-memory checkpoint store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl CheckpointStorage for MemoryStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| LatteError::Checkpoint(format!("no checkpoint named {key}")))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.lock().contains_key(key))
    }
}

/// Step counters stored alongside the tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Completed optimizer steps.
    pub global_step: u64,
    /// Current pass over the data.
    pub epoch: u64,
    /// Micro-batches already consumed from the current pass.
    pub epoch_batches: u64,
    /// AdamW bias-correction counter.
    pub optimizer_step: u64,
    pub scheduler: SchedulerState,
}

/// Deep copy of everything a full record needs, taken between steps.
#[derive(Debug, Clone)]
pub struct TrainingSnapshot {
    pub live: Vec<(String, Tensor)>,
    pub shadow: Vec<(String, Tensor)>,
    pub exp_avg: BTreeMap<String, Tensor>,
    pub exp_avg_sq: BTreeMap<String, Tensor>,
    /// Per-parameter AdamW bias-correction counters.
    pub optimizer_steps: BTreeMap<String, u64>,
    pub state: CheckpointState,
}

impl TrainingSnapshot {
    /// Copy live, shadow and optimizer state.
    ///
    /// The copies are independent of the running trainer, so they can be
    /// encoded on another thread while training continues.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor copy fails.
    pub fn capture(
        live: &ParameterSet,
        ema: &EmaShadow,
        coordinator: &OptimizerCoordinator,
        global_step: u64,
        epoch: u64,
        epoch_batches: u64,
    ) -> Result<Self> {
        let optimizer = coordinator.optimizer_state()?;
        Ok(Self {
            live: live.snapshot()?,
            shadow: ema.snapshot()?,
            state: CheckpointState {
                global_step,
                epoch,
                epoch_batches,
                optimizer_step: optimizer.t,
                scheduler: coordinator.scheduler_state(),
            },
            exp_avg: optimizer.exp_avg,
            exp_avg_sq: optimizer.exp_avg_sq,
            optimizer_steps: optimizer.steps,
        })
    }

    /// Serialize to a safetensors blob.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut tensors: Vec<(String, &Tensor)> = Vec::with_capacity(
            self.live.len() + self.shadow.len() + self.exp_avg.len() + self.exp_avg_sq.len(),
        );
        tensors.extend(self.live.iter().map(|(k, t)| (format!("{LIVE_PREFIX}{k}"), t)));
        tensors.extend(self.shadow.iter().map(|(k, t)| (format!("{SHADOW_PREFIX}{k}"), t)));
        tensors.extend(self.exp_avg.iter().map(|(k, t)| (format!("{EXP_AVG_PREFIX}{k}"), t)));
        tensors.extend(
            self.exp_avg_sq
                .iter()
                .map(|(k, t)| (format!("{EXP_AVG_SQ_PREFIX}{k}"), t)),
        );

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), FULL_FORMAT.to_string());
        metadata.insert("version".to_string(), CHECKPOINT_VERSION.to_string());
        metadata.insert("state".to_string(), serde_json::to_string(&self.state)?);
        metadata.insert(
            "optim_steps".to_string(),
            serde_json::to_string(&self.optimizer_steps)?,
        );
        metadata.insert("saved_at".to_string(), chrono::Utc::now().to_rfc3339());

        Ok(safetensors::tensor::serialize(tensors, &Some(metadata))?)
    }
}

/// Serialize plain weights with no training state (a legacy record).
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_weights(weights: &[(String, Tensor)]) -> Result<Vec<u8>> {
    let tensors = weights.iter().map(|(k, t)| (k.as_str(), t));
    Ok(safetensors::tensor::serialize(tensors, &None)?)
}

/// Decoded full record.
#[derive(Debug)]
pub struct FullCheckpoint {
    pub live: HashMap<String, Tensor>,
    pub shadow: HashMap<String, Tensor>,
    pub optimizer: AdamWState,
    pub state: CheckpointState,
    pub saved_at: Option<String>,
}

/// Which form a record was in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Full,
    Legacy,
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointKind::Full => write!(f, "full"),
            CheckpointKind::Legacy => write!(f, "legacy"),
        }
    }
}

/// A decoded record of either form.
#[derive(Debug)]
pub enum LoadedCheckpoint {
    Full(Box<FullCheckpoint>),
    /// Shadow-equivalent weights only.
    Legacy { shadow: HashMap<String, Tensor> },
}

impl LoadedCheckpoint {
    /// Decode a blob onto `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is not valid safetensors, or if it is a
    /// full record with an incompatible version or unreadable state.
    pub fn decode(bytes: &[u8], device: &Device) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = candle_core::safetensors::load_buffer(bytes, device)?;

        if metadata.get("format").map(String::as_str) != Some(FULL_FORMAT) {
            return Ok(Self::Legacy {
                shadow: select_prefixed(tensors, SHADOW_PREFIX),
            });
        }

        let version: u32 = metadata
            .get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| LatteError::Checkpoint("full checkpoint has no version".into()))?;
        if version != CHECKPOINT_VERSION {
            return Err(LatteError::Checkpoint(format!(
                "incompatible checkpoint version: {version} (expected {CHECKPOINT_VERSION})"
            )));
        }
        let state: CheckpointState = serde_json::from_str(
            metadata
                .get("state")
                .ok_or_else(|| LatteError::Checkpoint("full checkpoint has no state".into()))?,
        )?;
        // records written before per-parameter counters fall back to `t`
        let steps: BTreeMap<String, u64> = match metadata.get("optim_steps") {
            Some(json) => serde_json::from_str(json)?,
            None => BTreeMap::new(),
        };

        let mut live = HashMap::new();
        let mut shadow = HashMap::new();
        let mut exp_avg = BTreeMap::new();
        let mut exp_avg_sq = BTreeMap::new();
        for (key, tensor) in tensors {
            // exp_avg_sq before exp_avg: the latter is a prefix of the former
            if let Some(name) = key.strip_prefix(EXP_AVG_SQ_PREFIX) {
                exp_avg_sq.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(EXP_AVG_PREFIX) {
                exp_avg.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(LIVE_PREFIX) {
                live.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(SHADOW_PREFIX) {
                shadow.insert(name.to_string(), tensor);
            } else {
                tracing::warn!("Ignoring unrecognised checkpoint entry {key}");
            }
        }

        Ok(Self::Full(Box::new(FullCheckpoint {
            live,
            shadow,
            optimizer: AdamWState {
                t: state.optimizer_step,
                steps,
                exp_avg,
                exp_avg_sq,
            },
            state,
            saved_at: metadata.get("saved_at").cloned(),
        })))
    }

    /// Read and decode a checkpoint file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Checkpoint`] if the file cannot be read, or any
    /// error from [`decode`](Self::decode).
    pub fn from_file(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            LatteError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::decode(&bytes, device)
    }

    #[must_use]
    pub fn kind(&self) -> CheckpointKind {
        match self {
            Self::Full(_) => CheckpointKind::Full,
            Self::Legacy { .. } => CheckpointKind::Legacy,
        }
    }

    /// Completed steps recorded in a full checkpoint.
    #[must_use]
    pub fn global_step(&self) -> Option<u64> {
        match self {
            Self::Full(full) => Some(full.state.global_step),
            Self::Legacy { .. } => None,
        }
    }

    /// Weights usable for inference: the shadow set.
    #[must_use]
    pub fn shadow_weights(&self) -> &HashMap<String, Tensor> {
        match self {
            Self::Full(full) => &full.shadow,
            Self::Legacy { shadow } => shadow,
        }
    }
}

/// Keep only the `prefix` sub-dict, with the prefix removed, when any key
/// carries it. Otherwise return `tensors` unchanged.
fn select_prefixed(tensors: HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    if !tensors.keys().any(|k| k.starts_with(prefix)) {
        return tensors;
    }
    let total = tensors.len();
    let selected: HashMap<String, Tensor> = tensors
        .into_iter()
        .filter_map(|(k, t)| k.strip_prefix(prefix).map(|name| (name.to_string(), t)))
        .collect();
    if selected.len() < total {
        tracing::info!(
            "Using the {prefix}* entries of the checkpoint, skipping {} others",
            total - selected.len()
        );
    }
    selected
}

/// What applying a checkpoint changed.
#[derive(Debug, Clone)]
pub struct RestoredState {
    pub kind: CheckpointKind,
    pub global_step: u64,
    pub epoch: u64,
    /// Partial-load report for the live set.
    pub live_report: LoadReport,
    /// Partial-load report for the shadow set; `None` when it was re-synced.
    pub shadow_report: Option<LoadReport>,
}

/// Writes checkpoints at a fixed cadence, one in flight at a time.
pub struct CheckpointManager {
    storage: Arc<dyn CheckpointStorage>,
    save_interval: u64,
    pending: Option<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("save_interval", &self.save_interval)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl CheckpointManager {
    #[must_use]
    pub fn new(storage: Arc<dyn CheckpointStorage>, save_interval: u64) -> Self {
        Self {
            storage,
            save_interval,
            pending: None,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
        &self.storage
    }

    /// Whether a checkpoint is due after `step` completed steps.
    #[must_use]
    pub fn should_save(&self, step: u64) -> bool {
        self.save_interval > 0 && step > 0 && step % self.save_interval == 0
    }

    /// Encode and write synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if a previous background write failed, or if
    /// encoding or writing this one fails.
    pub fn save(&mut self, key: &str, snapshot: &TrainingSnapshot) -> Result<()> {
        self.wait()?;
        let bytes = snapshot.encode()?;
        self.storage.write(key, &bytes)?;
        tracing::info!("Saved checkpoint to {key}");
        Ok(())
    }

    /// Encode and write on a background thread.
    ///
    /// Waits for the previous write first, so at most one is in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the previous write failed or the writer thread
    /// cannot be spawned. Failures of this write surface from the next
    /// [`wait`](Self::wait).
    pub fn save_in_background(&mut self, key: String, snapshot: TrainingSnapshot) -> Result<()> {
        self.wait()?;
        let storage = Arc::clone(&self.storage);
        let handle = std::thread::Builder::new()
            .name("latte-checkpoint".into())
            .spawn(move || -> Result<()> {
                let bytes = snapshot.encode()?;
                storage.write(&key, &bytes)?;
                tracing::info!("Saved checkpoint to {key}");
                Ok(())
            })?;
        self.pending = Some(handle);
        Ok(())
    }

    /// Block until the in-flight write, if any, has finished.
    ///
    /// # Errors
    ///
    /// Returns the write's error, or [`LatteError::Checkpoint`] if the
    /// writer thread panicked.
    pub fn wait(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| LatteError::Checkpoint("checkpoint writer panicked".into()))?,
            None => Ok(()),
        }
    }

    /// Read and decode `key` from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending write failed, the key cannot be read
    /// or the blob cannot be decoded.
    pub fn load(&mut self, key: &str, device: &Device) -> Result<LoadedCheckpoint> {
        self.wait()?;
        let bytes = self.storage.read(key)?;
        LoadedCheckpoint::decode(&bytes, device)
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            tracing::error!("Checkpoint write failed during shutdown: {e}");
        }
    }
}
