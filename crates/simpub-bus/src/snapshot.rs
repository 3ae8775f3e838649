//! Tracked signals and the aggregated state snapshot.
//!
//! A [`SignalSet`] is a name-keyed table of value getters. Every publish
//! tick it is polled as a whole and the results become one JSON object,
//! the [`StateSnapshot`], which is what a state topic such as
//! `SceneUpdate` carries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::{BusError, BusResult};
use crate::streamer::TopicProducer;

type Getter = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;

/// Most recent value of every tracked signal, keyed by signal name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StateSnapshot(pub BTreeMap<String, Value>);

impl StateSnapshot {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }
}

/// Registered signals. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct SignalSet {
    signals: Arc<DashMap<String, Getter>>,
    excluded: Arc<BTreeSet<String>>,
}

impl SignalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals named in `excluded` can be tracked but are never published.
    pub fn with_excluded<I, S>(excluded: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            signals: Arc::default(),
            excluded: Arc::new(excluded.into_iter().map(Into::into).collect()),
        }
    }

    /// Track a signal. Safe before or after publishing starts; never
    /// replaces an existing signal.
    pub fn track<F, T>(&self, name: impl Into<String>, value: F) -> BusResult<()>
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Serialize,
    {
        let name = name.into();
        let getter: Getter =
            Arc::new(move || -> anyhow::Result<Value> { Ok(serde_json::to_value(value())?) });
        match self.signals.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(BusError::DuplicateSignal(e.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(getter);
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.signals.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Poll every non-excluded signal. A signal whose value fails to
    /// serialize is left out of this snapshot and logged.
    pub fn snapshot(&self) -> StateSnapshot {
        // Collect getters first so no shard lock is held while user code runs.
        let getters: Vec<(String, Getter)> = self
            .signals
            .iter()
            .filter(|e| !self.excluded.contains(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut values = BTreeMap::new();
        for (name, getter) in getters {
            match getter() {
                Ok(value) => {
                    values.insert(name, value);
                }
                Err(e) => tracing::warn!(signal = %name, error = %e, "signal not serializable"),
            }
        }
        StateSnapshot(values)
    }
}

impl TopicProducer for SignalSet {
    fn produce(&self) -> anyhow::Result<Bytes> {
        self.snapshot().to_json()
    }
}
