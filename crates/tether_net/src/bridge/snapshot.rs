//! Snapshot publication from the simulation thread to the broadcast tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tether_shared::ObjectState;

#[derive(Debug, Default)]
struct Inner {
    objects: RwLock<Arc<Vec<ObjectState>>>,
    generation: AtomicU64,
}

/// Latest published world snapshot.
///
/// The simulation publishes once per frame; the network thread reads
/// whatever was published last. Clones share the same cell.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCell {
    inner: Arc<Inner>,
}

impl SnapshotCell {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot.
    pub fn publish(&self, objects: Vec<ObjectState>) {
        *self.inner.objects.write() = Arc::new(objects);
        self.inner.generation.fetch_add(1, Ordering::Release);
    }

    /// Copy of the last published snapshot.
    #[must_use]
    pub fn read(&self) -> Vec<ObjectState> {
        let shared = Arc::clone(&self.inner.objects.read());
        shared.as_ref().clone()
    }

    /// Number of publishes so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// State provider reading this cell.
    #[must_use]
    pub fn provider(&self) -> impl Fn() -> Vec<ObjectState> + Send + Sync + 'static {
        let cell = self.clone();
        move || cell.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_shared::Vec2;

    #[test]
    fn test_publish_and_read() {
        let cell = SnapshotCell::new();
        assert!(cell.read().is_empty());
        assert_eq!(cell.generation(), 0);

        cell.publish(vec![ObjectState::at_rest(1, Vec2::new(2.0, 3.0), 0.0)]);
        assert_eq!(cell.read().len(), 1);
        assert_eq!(cell.generation(), 1);
    }

    #[test]
    fn test_provider_sees_later_publishes() {
        let cell = SnapshotCell::new();
        let provider = cell.provider();
        cell.publish(vec![ObjectState::default(); 2]);

        let reader = std::thread::spawn(move || provider().len());
        assert_eq!(reader.join().unwrap(), 2);
    }
}
