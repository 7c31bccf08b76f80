/// Per-resolution callback dispatch
use std::sync::Arc;

use crate::data::Resolution;
use crate::types::Bar;

/// Shared callback invoked with a value of type `T`
pub type Trigger<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Fixed table of callbacks, one slot per [`Resolution`].
///
/// Filled once at startup and read-only afterwards; dispatching to an empty
/// slot reports `false` instead of failing.
pub struct TriggerRegistry<T> {
    slots: [Option<Trigger<T>>; Resolution::COUNT],
}

impl<T> TriggerRegistry<T> {
    pub fn new() -> Self {
        TriggerRegistry {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Install the callback for `resolution`, replacing any previous one
    pub fn register(&mut self, resolution: Resolution, trigger: Trigger<T>) {
        self.slots[resolution.index()] = Some(trigger);
    }

    /// Invoke the callback for `resolution`; `false` if none is registered
    pub fn trigger(&self, resolution: Resolution, value: T) -> bool {
        match &self.slots[resolution.index()] {
            Some(trigger) => {
                trigger(value);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, resolution: Resolution) -> bool {
        self.slots[resolution.index()].is_some()
    }
}

impl<T> Default for TriggerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registries linking each accumulator to its pipeline's workers
#[derive(Default)]
pub struct Triggers {
    /// Finalized bar ready for the write buffer
    pub store: TriggerRegistry<Bar>,
    /// Live feed bootstrapped at this open-time; catch up to it
    pub uptodate: TriggerRegistry<i64>,
    /// Scan for gaps up to and including this open-time
    pub check: TriggerRegistry<i64>,
}

impl Triggers {
    pub fn new() -> Self {
        Self::default()
    }
}
