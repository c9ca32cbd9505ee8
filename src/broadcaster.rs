//! Single-consumer fan-out: drains the camera's NAL channel, keeps the
//! keyframe cache current, and pushes each unit to the recorder (if armed)
//! and every registered viewer.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::dropqueue::DropOldestReceiver;
use crate::keyframe::KeyframeCache;
use crate::nal::NalUnit;
use crate::registry::ViewerRegistry;

/// Non-blocking sink the broadcaster forwards units to in addition to the
/// viewer registry. The recorder implements this so the broadcaster doesn't
/// need to know about recording state directly.
pub trait RecorderSink: Send + Sync {
    fn push(&self, unit: NalUnit);
}

pub struct Broadcaster {
    keyframe_cache: Arc<KeyframeCache>,
    registry: Arc<ViewerRegistry>,
    recorder: Mutex<Option<Arc<dyn RecorderSink>>>,
}

impl Broadcaster {
    pub fn new(keyframe_cache: Arc<KeyframeCache>, registry: Arc<ViewerRegistry>) -> Self {
        Self {
            keyframe_cache,
            registry,
            recorder: Mutex::new(None),
        }
    }

    /// Attaches (or detaches, with `None`) the recorder sink. Taken under a
    /// lock since recordings start and stop independently of the broadcast
    /// loop's own lifetime.
    pub async fn set_recorder(&self, recorder: Option<Arc<dyn RecorderSink>>) {
        *self.recorder.lock().await = recorder;
    }

    /// Runs the fan-out loop until `rx` closes (camera stopped). Intended to
    /// be spawned as its own task for the lifetime of the server.
    pub async fn run(self: Arc<Self>, mut rx: DropOldestReceiver<NalUnit>) {
        info!("broadcaster started");
        while let Some(unit) = rx.recv().await {
            self.keyframe_cache.observe(&unit).await;

            if let Some(recorder) = self.recorder.lock().await.as_ref() {
                recorder.push(unit.clone());
            }

            self.registry.broadcast(&unit).await;
        }
        info!("broadcaster stopped: camera channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dropqueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        count: AtomicUsize,
    }

    impl RecorderSink for CountingSink {
        fn push(&self, _unit: NalUnit) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn forwards_every_unit_to_keyframe_cache_and_recorder() {
        let cache = Arc::new(KeyframeCache::new());
        let registry = Arc::new(ViewerRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(cache.clone(), registry));

        let sink = Arc::new(CountingSink { count: AtomicUsize::new(0) });
        broadcaster.set_recorder(Some(sink.clone())).await;

        let (tx, rx) = dropqueue::channel(16);
        tx.push(NalUnit::from_payload(&[0x67, 1, 2])); // SPS
        tx.push(NalUnit::from_payload(&[0x68, 3, 4])); // PPS
        tx.push(NalUnit::from_payload(&[0x65, 5, 6])); // IDR
        tx.close();

        broadcaster.run(rx).await;

        assert!(cache.has_sps_pps().await);
        assert_eq!(sink.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn runs_without_recorder_attached() {
        let cache = Arc::new(KeyframeCache::new());
        let registry = Arc::new(ViewerRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(cache, registry));

        let (tx, rx) = dropqueue::channel(16);
        tx.push(NalUnit::from_payload(&[0x65, 1]));
        tx.close();

        // Should complete without panicking even though no recorder is set.
        broadcaster.run(rx).await;
    }
}
