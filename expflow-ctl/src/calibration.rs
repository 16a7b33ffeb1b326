//! Calibration registry
//!
//! Maps a calibration name to the callback that runs it. The registry is
//! owned by one controller; nothing here is process-wide.
//!
//! A callback receives the block config and a [`CalibrationHandle`]. The
//! handle's [`CalibrationHandle::complete`] is the only way the controller
//! leaves `Calibrating`. There is no timeout: calibration is supervised by the
//! operator, and an uncompleted calibration holds the block indefinitely.

use crate::block::BlockConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Calibration callback
pub type CalibrationFn = Arc<dyn Fn(&BlockConfig, CalibrationHandle) + Send + Sync>;

/// Completion message posted by a [`CalibrationHandle`]
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSignal {
    /// Calibration run the signal belongs to; stale runs are ignored
    pub generation: u64,
    pub parameters: Value,
}

/// Completion signal handed to a calibration callback
///
/// Cloneable and usable from any thread. Completing after the controller has
/// stopped, or after the calibration it belongs to is over, is logged and
/// otherwise ignored.
#[derive(Clone)]
pub struct CalibrationHandle {
    name: String,
    generation: u64,
    tx: mpsc::UnboundedSender<CalibrationSignal>,
}

impl CalibrationHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<CalibrationSignal>,
    ) -> Self {
        Self {
            name: name.into(),
            generation,
            tx,
        }
    }

    /// Name of the calibration this handle belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal that calibration finished, with its resulting parameters
    pub fn complete(&self, parameters: Value) {
        let signal = CalibrationSignal {
            generation: self.generation,
            parameters,
        };
        if self.tx.send(signal).is_err() {
            warn!(calibration = %self.name, "Calibration completed after controller stopped");
        }
    }
}

impl std::fmt::Debug for CalibrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationHandle")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Name to callback mapping, last registration wins
#[derive(Default)]
pub struct CalibrationRegistry {
    callbacks: HashMap<String, CalibrationFn>,
}

impl CalibrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`
    ///
    /// Returns true if an earlier callback was replaced.
    pub fn register(&mut self, name: impl Into<String>, callback: CalibrationFn) -> bool {
        let name = name.into();
        let replaced = self.callbacks.insert(name.clone(), callback).is_some();
        debug!(calibration = %name, replaced, "Calibration registered");
        replaced
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.callbacks.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Run the callback registered under `name`
    ///
    /// Returns false, without side effects, when nothing is registered.
    pub fn invoke(&self, name: &str, config: &BlockConfig, handle: CalibrationHandle) -> bool {
        match self.callbacks.get(name) {
            Some(callback) => {
                callback(config, handle);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>, step: usize) -> CalibrationFn {
        Arc::new(move |_config, _handle| {
            counter.fetch_add(step, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_reregister_overwrites() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = CalibrationRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(!registry.register("hand", counting(counter.clone(), 1)));
        assert!(registry.register("hand", counting(counter.clone(), 10)));
        assert_eq!(registry.len(), 1);

        let config = BlockConfig::named("b1").with_calibration("hand");
        assert!(registry.invoke("hand", &config, CalibrationHandle::new("hand", 1, tx)));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_invoke_unregistered_is_false() {
        let registry = CalibrationRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = BlockConfig::named("b1");
        assert!(!registry.invoke("missing", &config, CalibrationHandle::new("missing", 1, tx)));
    }

    #[tokio::test]
    async fn test_handle_delivers_parameters() {
        let mut registry = CalibrationRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(
            "hand",
            Arc::new(|config: &BlockConfig, handle: CalibrationHandle| {
                handle.complete(json!({ "block": config.name }));
            }),
        );

        let config = BlockConfig::named("b7");
        registry.invoke("hand", &config, CalibrationHandle::new("hand", 1, tx));
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.generation, 1);
        assert_eq!(signal.parameters, json!({ "block": "b7" }));
    }

    #[test]
    fn test_complete_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        CalibrationHandle::new("hand", 1, tx).complete(Value::Null);
    }
}
