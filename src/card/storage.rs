//! Card state persistence
//!
//! The whole card state lives in one JSON file. Writes go through a
//! temporary file followed by a rename, so a failed write leaves the
//! previous state intact and a half-written document is never visible to
//! the next load.

use std::fs;
use std::path::PathBuf;

use log::{debug, info, warn};
use thiserror::Error;

use super::state::CardState;

/// Persistence errors; handlers surface them as MEMORY_FAILURE
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state (de)serialization failed: {0}")]
    Format(#[from] serde_json::Error),
}

/// Persistent store for the card state
pub struct DataStore {
    storage_dir: PathBuf,
    state_file: PathBuf,
    state: CardState,
}

impl DataStore {
    const STATE_FILE: &'static str = "token_state.json";

    fn default_storage_dir() -> PathBuf {
        if let Ok(path) = std::env::var("PGPTOKEN_STORAGE_DIR") {
            return PathBuf::from(path);
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".pgptoken");
        }
        PathBuf::from("/var/lib/pgptoken")
    }

    /// Create a store rooted at `storage_dir`, or at the default
    /// location when none is given
    pub fn new(storage_dir: Option<PathBuf>) -> Self {
        let storage_dir = storage_dir.unwrap_or_else(Self::default_storage_dir);
        let state_file = storage_dir.join(Self::STATE_FILE);
        Self {
            storage_dir,
            state_file,
            state: CardState::default(),
        }
    }

    /// Load the card state. Returns true when an existing state was
    /// read; otherwise the factory state is installed.
    pub fn load(&mut self) -> bool {
        if !self.state_file.exists() {
            info!("no existing card state, starting from factory defaults");
            self.state = CardState::default();
            return false;
        }

        match fs::read_to_string(&self.state_file) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => {
                    info!("loaded card state from {:?}", self.state_file);
                    self.state = state;
                    true
                }
                Err(e) => {
                    warn!("unparseable card state, starting fresh: {}", e);
                    self.state = CardState::default();
                    false
                }
            },
            Err(e) => {
                warn!("failed to read card state, starting fresh: {}", e);
                self.state = CardState::default();
                false
            }
        }
    }

    /// Persist the card state atomically
    pub fn save(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.storage_dir)?;

        let json = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.state_file)?;

        debug!("saved card state to {:?}", self.state_file);
        Ok(())
    }

    pub fn state(&self) -> &CardState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CardState {
        &mut self.state
    }
}
