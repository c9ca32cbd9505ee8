//! Threadsafe set of live viewers.
//!
//! The registry is the synchronization point that defeats the race between
//! "a viewer joins" and "the broadcaster fans out a NAL unit": a viewer is
//! primed with cached keyframes *before* it is inserted into the map the
//! broadcaster iterates, so it can never observe a live NAL before its
//! priming burst.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::keyframe::KeyframeCache;
use crate::nal::NalUnit;
use crate::viewer::Viewer;

struct Entry {
    viewer: Arc<Viewer>,
    drain: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct ViewerRegistry {
    viewers: RwLock<HashMap<uuid::Uuid, Entry>>,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primes `viewer` from the keyframe cache, then inserts it and spawns
    /// its drain task. Priming happens before the write-lock insert, so the
    /// broadcaster (which only ever holds a read lock) cannot interleave.
    pub async fn add(&self, viewer: Arc<Viewer>, keyframe_cache: &KeyframeCache) {
        let snapshot = keyframe_cache.snapshot().await;
        viewer.prime(&snapshot).await;

        let drain = viewer.spawn_drain();

        let mut map = self.viewers.write().await;
        let count = map.len() + 1;
        map.insert(viewer.id, Entry { viewer, drain });
        info!(viewer_count = count, "viewer joined");
    }

    /// Removes a viewer, signals its drain task to stop, and joins it before
    /// returning.
    pub async fn remove(&self, id: uuid::Uuid) {
        let entry = self.viewers.write().await.remove(&id);
        if let Some(Entry { viewer, drain }) = entry {
            viewer.cancel();
            let _ = drain.await;
            let count = self.viewers.read().await.len();
            info!(viewer_count = count, "viewer left");
        }
    }

    /// Non-blocking fan-out: pushes `unit` onto every registered viewer's
    /// inbox. Holds only a read lock for the duration of the iteration.
    pub async fn broadcast(&self, unit: &NalUnit) {
        let map = self.viewers.read().await;
        for entry in map.values() {
            entry.viewer.push(unit.clone());
        }
    }

    pub async fn len(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.viewers.read().await.is_empty()
    }

    /// Cancels every viewer's drain task and closes its peer connection,
    /// joining each drain task before returning. Used on process shutdown.
    pub async fn close_all(&self) {
        let map = std::mem::take(&mut *self.viewers.write().await);
        for (_, Entry { viewer, drain }) in map {
            viewer.cancel();
            let _ = viewer.peer().close().await;
            let _ = drain.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::NalUnit;
    use crate::viewer::test_support::dummy_viewer;

    #[tokio::test]
    async fn add_and_remove_tracks_count() {
        let registry = ViewerRegistry::new();
        let cache = KeyframeCache::new();
        assert!(registry.is_empty().await);

        let viewer = dummy_viewer().await;
        let id = viewer.id;
        registry.add(viewer, &cache).await;
        assert_eq!(registry.len().await, 1);

        registry.remove(id).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn priming_happens_before_viewer_is_visible_to_broadcast() {
        let registry = ViewerRegistry::new();
        let cache = KeyframeCache::new();
        cache.observe(&NalUnit::from_payload(&[0x67, 1, 2])).await; // SPS
        cache.observe(&NalUnit::from_payload(&[0x68, 3, 4])).await; // PPS
        cache.observe(&NalUnit::from_payload(&[0x65, 5, 6])).await; // IDR

        let viewer = dummy_viewer().await;
        registry.add(viewer.clone(), &cache).await;

        // Priming advanced sent_frames by 3 (SPS, PPS, IDR) before any live
        // broadcast could have reached this viewer.
        assert_eq!(viewer.sent_frames(), 3);
    }

    #[tokio::test]
    async fn broadcast_pushes_to_every_registered_viewer() {
        let registry = ViewerRegistry::new();
        let cache = KeyframeCache::new();
        let a = dummy_viewer().await;
        let b = dummy_viewer().await;
        registry.add(a.clone(), &cache).await;
        registry.add(b.clone(), &cache).await;

        registry.broadcast(&NalUnit::from_payload(&[0x61, 1])).await;
        // Give the drain tasks a tick to process the inbox.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(a.sent_frames(), 1);
        assert_eq!(b.sent_frames(), 1);
    }
}
