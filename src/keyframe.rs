//! Cache of the most recently seen SPS, PPS, and IDR NAL units.
//!
//! Written only by the broadcaster task; read by anything registering a new
//! viewer or starting a recording. Guarded by a single lock rather than three
//! separate ones, since all three fields are always read together (priming a
//! joining viewer needs all of them in one atomic snapshot).

use tokio::sync::RwLock;

use crate::nal::NalUnit;

#[derive(Default, Clone)]
pub struct KeyframeSnapshot {
    pub sps: Option<NalUnit>,
    pub pps: Option<NalUnit>,
    pub last_idr: Option<NalUnit>,
}

#[derive(Default)]
pub struct KeyframeCache {
    inner: RwLock<KeyframeSnapshot>,
}

impl KeyframeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes a NAL unit, updating the cache if it's an SPS, PPS, or IDR.
    /// Only the broadcaster task should call this.
    pub async fn observe(&self, unit: &NalUnit) {
        if unit.is_sps() {
            let mut guard = self.inner.write().await;
            // Skip reassignment if bytes are unchanged, to avoid churn.
            if guard.sps.as_ref().map(|s| s.data.as_ref()) != Some(unit.data.as_ref()) {
                guard.sps = Some(unit.clone());
            }
        } else if unit.is_pps() {
            let mut guard = self.inner.write().await;
            if guard.pps.as_ref().map(|s| s.data.as_ref()) != Some(unit.data.as_ref()) {
                guard.pps = Some(unit.clone());
            }
        } else if unit.is_idr() {
            // Always refresh: every keyframe's payload differs.
            let mut guard = self.inner.write().await;
            guard.last_idr = Some(unit.clone());
        }
    }

    /// Returns a cloned snapshot of the cache for priming a joining viewer or
    /// starting a recording. Callers must not retain references into the
    /// cache across a lock release — this returns owned copies for that reason.
    pub async fn snapshot(&self) -> KeyframeSnapshot {
        self.inner.read().await.clone()
    }

    pub async fn has_sps_pps(&self) -> bool {
        let guard = self.inner.read().await;
        guard.sps.is_some() && guard.pps.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps() -> NalUnit {
        NalUnit::from_payload(&[0x67, 1, 2, 3])
    }
    fn pps() -> NalUnit {
        NalUnit::from_payload(&[0x68, 4, 5])
    }
    fn idr(tag: u8) -> NalUnit {
        NalUnit::from_payload(&[0x65, tag])
    }

    #[tokio::test]
    async fn caches_sps_pps_and_always_refreshes_idr() {
        let cache = KeyframeCache::new();
        cache.observe(&sps()).await;
        cache.observe(&pps()).await;
        cache.observe(&idr(1)).await;
        cache.observe(&idr(2)).await;

        let snap = cache.snapshot().await;
        assert!(snap.sps.is_some());
        assert!(snap.pps.is_some());
        assert_eq!(snap.last_idr.unwrap().payload(), &[0x65, 2]);
    }

    #[tokio::test]
    async fn has_sps_pps_false_until_both_present() {
        let cache = KeyframeCache::new();
        assert!(!cache.has_sps_pps().await);
        cache.observe(&sps()).await;
        assert!(!cache.has_sps_pps().await);
        cache.observe(&pps()).await;
        assert!(cache.has_sps_pps().await);
    }
}
