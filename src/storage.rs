//! External key/value storage for persisted settings.
//!
//! The storage backend proper lives outside the library; this module defines
//! the interface the core reads through, a process-environment default, and an
//! in-memory implementation with change notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::Error;

/// Storage key holding the partition-count cap, read once at initialization.
pub const SETTING_MAX_PARTITION_COUNT: &str = "MaxPartitionCount";

/// Invoked by a storage backend when any persisted value changes.
pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Read-only view of persisted settings.
pub trait Storage: Send + Sync {
    /// Reads a 32-bit value, `None` when the key is absent.
    fn read_u32(&self, name: &str) -> Option<u32>;

    /// Registers the callback fired on changes. Backends without change
    /// detection ignore this.
    fn set_change_callback(&self, _callback: ChangeCallback) {}
}

/// Opens the process-default storage. Failure here is non-fatal to library
/// initialization; the caller falls back to pure defaults.
pub(crate) fn open() -> Result<Arc<dyn Storage>, Error> {
    Ok(Arc::new(EnvStorage { prefix: "QUILL_" }))
}

/// Reads persisted overrides from the process environment, e.g.
/// `QUILL_MaxPartitionCount=8`. The environment never notifies of changes.
struct EnvStorage {
    prefix: &'static str,
}

impl Storage for EnvStorage {
    fn read_u32(&self, name: &str) -> Option<u32> {
        let value = std::env::var(format!("{}{}", self.prefix, name)).ok()?;
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                debug!("ignoring unparsable override {}{}={}", self.prefix, name, value);
                None
            }
        }
    }
}

/// In-memory storage with change notification, for harnesses that need to
/// exercise the reload path.
#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, u32>>,
    callback: Mutex<Option<ChangeCallback>>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores a value and fires the change callback, as a real backend would
    /// on an external write.
    pub fn write_u32(&self, name: &str, value: u32) {
        self.values
            .lock()
            .unwrap()
            .insert(name.to_owned(), value);
        if let Some(callback) = &*self.callback.lock().unwrap() {
            callback();
        }
    }
}

impl Storage for MemoryStorage {
    fn read_u32(&self, name: &str) -> Option<u32> {
        self.values.lock().unwrap().get(name).copied()
    }

    fn set_change_callback(&self, callback: ChangeCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}
