//! Per-peer viewer: owns the RTP track, the NAL inbox, and the drain task
//! that packetizes and writes RTP for one connected browser.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rtp::codecs::h264::H264Payloader;
use rtp::packetizer::Payloader;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::keyframe::KeyframeSnapshot;
use crate::nal::NalUnit;

/// RFC 6184 MTU for the RTP payload (excludes header).
pub const RTP_MTU: usize = 1200;
/// H.264 RTP clock rate, fixed per RFC 6184.
pub const H264_CLOCK_RATE: u32 = 90_000;
/// Dynamic payload type used for H.264, per this deployment's fixed SDP offer.
pub const H264_PAYLOAD_TYPE: u8 = 96;
/// Bounded per-viewer NAL inbox. A full inbox drops the incoming unit (the
/// opposite policy from the camera ingest channel) — see [`crate::dropqueue`].
pub const INBOX_CAPACITY: usize = 500;

/// Builds the codec capability advertised for every viewer's video track.
pub fn h264_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

struct RtpState {
    payloader: H264Payloader,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    ts_increment: u32,
}

#[derive(Serialize)]
struct StatsMessage {
    #[serde(rename = "sentFrames")]
    sent_frames: u64,
    #[serde(rename = "droppedFrames")]
    dropped_frames: u64,
    timestamp: u64,
}

/// A single connected viewer: one peer connection, one video track, one
/// drain task.
pub struct Viewer {
    pub id: uuid::Uuid,
    peer: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
    rtp_state: Mutex<RtpState>,
    inbox_tx: mpsc::Sender<NalUnit>,
    inbox_rx: Mutex<Option<mpsc::Receiver<NalUnit>>>,
    sent_frames: AtomicU64,
    dropped_frames: AtomicU64,
    data_channel: RwLock<Option<Arc<RTCDataChannel>>>,
    state_rx: watch::Receiver<RTCPeerConnectionState>,
    done: CancellationToken,
}

impl Viewer {
    pub fn new(
        peer: Arc<RTCPeerConnection>,
        track: Arc<TrackLocalStaticRTP>,
        framerate: u32,
        state_rx: watch::Receiver<RTCPeerConnectionState>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let ts_increment = H264_CLOCK_RATE / framerate.max(1);

        Arc::new(Self {
            id: uuid::Uuid::new_v4(),
            peer,
            track,
            rtp_state: Mutex::new(RtpState {
                payloader: H264Payloader::default(),
                sequence_number: rand::random::<u16>(),
                timestamp: 0,
                ssrc: rand::random::<u32>(),
                ts_increment,
            }),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            sent_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            data_channel: RwLock::new(None),
            state_rx,
            done: CancellationToken::new(),
        })
    }

    pub fn peer(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }

    pub async fn set_data_channel(&self, dc: Arc<RTCDataChannel>) {
        *self.data_channel.write().await = Some(dc);
    }

    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == RTCPeerConnectionState::Connected
    }

    /// Current value of the monotonic RTP timestamp cursor. Test-only: exists
    /// so the RTP timestamp law (advances by exactly `90000/fps` per NAL, all
    /// fragments of one NAL share a timestamp) can be asserted without a real
    /// WebRTC transport to inspect outgoing packets on.
    #[cfg(test)]
    pub(crate) async fn current_timestamp(&self) -> u32 {
        self.rtp_state.lock().await.timestamp
    }

    /// Non-blocking push used by the broadcaster's fan-out loop. On overflow,
    /// the new unit is dropped (drop-current) and the counter incremented —
    /// never block the broadcaster on a slow viewer.
    pub fn push(&self, unit: NalUnit) {
        if self.inbox_tx.try_send(unit).is_err() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Writes one NAL unit through the packetize-and-write path, advancing
    /// the viewer's own monotonic timestamp cursor by one frame increment.
    /// Used both for live NAL units and for the keyframe priming burst, so
    /// both share timestamp-law and fragmentation behavior.
    async fn write_nal(&self, unit: &NalUnit) {
        let (payloads, timestamp, seq_start, ssrc) = {
            let mut state = self.rtp_state.lock().await;
            state.timestamp = state.timestamp.wrapping_add(state.ts_increment);

            let payloads = match state.payloader.payload(RTP_MTU, &Bytes::copy_from_slice(unit.payload())) {
                Ok(p) => p,
                Err(e) => {
                    warn!("H264 packetization failed: {e}");
                    return;
                }
            };
            if payloads.is_empty() {
                return;
            }
            let seq_start = state.sequence_number;
            state.sequence_number = state.sequence_number.wrapping_add(payloads.len() as u16);
            (payloads, state.timestamp, seq_start, state.ssrc)
        };

        let num_payloads = payloads.len();
        for (i, payload) in payloads.into_iter().enumerate() {
            let packet = rtp::packet::Packet {
                header: rtp::header::Header {
                    version: 2,
                    padding: false,
                    extension: false,
                    marker: i == num_payloads - 1,
                    payload_type: H264_PAYLOAD_TYPE,
                    sequence_number: seq_start.wrapping_add(i as u16),
                    timestamp,
                    ssrc,
                    ..Default::default()
                },
                payload,
            };
            if let Err(e) = self.track.write_rtp(&packet).await {
                trace!("RTP write failed: {e}");
            }
        }
    }

    /// Pushes the cached SPS/PPS/last-IDR (in that order) through the same
    /// packetize-and-write path as live units, advancing the cursor once per
    /// unit. Called once, before the viewer becomes visible to the
    /// broadcaster's fan-out iteration.
    pub async fn prime(&self, snapshot: &KeyframeSnapshot) {
        for unit in [&snapshot.sps, &snapshot.pps, &snapshot.last_idr]
            .into_iter()
            .flatten()
        {
            self.write_nal(unit).await;
            self.sent_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Spawns the drain task: multiplexes the inbox, a 1s stats tick, and the
    /// cancellation signal. Consumes the inbox receiver, so this may only be
    /// called once per viewer.
    pub fn spawn_drain(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let viewer = self.clone();
        let mut rx = viewer
            .inbox_rx
            .try_lock()
            .expect("spawn_drain called concurrently")
            .take()
            .expect("spawn_drain called more than once");

        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    biased;
                    _ = viewer.done.cancelled() => {
                        debug!(viewer = %viewer.id, "drain task cancelled");
                        break;
                    }
                    maybe_unit = rx.recv() => {
                        match maybe_unit {
                            Some(unit) => {
                                if viewer.is_connected() {
                                    viewer.write_nal(&unit).await;
                                    viewer.sent_frames.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tick.tick() => {
                        viewer.send_stats().await;
                    }
                }
            }
            rx.close();
        })
    }

    async fn send_stats(&self) {
        let dc = self.data_channel.read().await;
        let Some(dc) = dc.as_ref() else { return };
        if dc.ready_state() != webrtc::data_channel::data_channel_state::RTCDataChannelState::Open {
            return;
        }
        let msg = StatsMessage {
            sent_frames: self.sent_frames(),
            dropped_frames: self.dropped_frames(),
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        };
        match serde_json::to_string(&msg) {
            Ok(text) => {
                if let Err(e) = dc.send_text(text).await {
                    debug!(viewer = %self.id, "failed to send stats over data channel: {e}");
                }
            }
            Err(e) => warn!("failed to serialize viewer stats: {e}"),
        }
    }

    /// Signals the drain task to exit. Does not wait for it — callers that
    /// need to join should await the `JoinHandle` returned by `spawn_drain`.
    pub fn cancel(&self) {
        self.done.cancel();
    }
}

/// Test-only helpers for building a `Viewer` without a real signaling round
/// trip. Used by this module's own tests and by [`crate::registry`]'s.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    pub async fn dummy_viewer() -> Arc<Viewer> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap());
        let track = Arc::new(TrackLocalStaticRTP::new(
            h264_codec_capability(),
            "video0".to_string(),
            "test-stream".to_string(),
        ));
        let (_tx, rx) = watch::channel(RTCPeerConnectionState::Connected);
        Viewer::new(pc, track, 30, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_increment_matches_90000_over_fps() {
        assert_eq!(H264_CLOCK_RATE / 30, 3000);
        assert_eq!(H264_CLOCK_RATE / 25, 3600);
    }

    #[test]
    fn codec_capability_matches_required_fmtp() {
        let cap = h264_codec_capability();
        assert_eq!(cap.mime_type, "video/H264");
        assert_eq!(cap.clock_rate, 90_000);
        assert_eq!(
            cap.sdp_fmtp_line,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
        );
    }

    #[tokio::test]
    async fn full_inbox_drops_without_blocking_the_producer() {
        let viewer = test_support::dummy_viewer().await;
        // Drain task is never spawned, so nothing ever empties the inbox;
        // pushes past capacity must drop the new unit, not block the caller.
        for i in 0..INBOX_CAPACITY {
            viewer.push(NalUnit::from_payload(&[0x61, (i % 250) as u8]));
        }
        assert_eq!(viewer.dropped_frames(), 0);

        viewer.push(NalUnit::from_payload(&[0x61, 1]));
        viewer.push(NalUnit::from_payload(&[0x61, 2]));
        assert_eq!(viewer.dropped_frames(), 2);
    }

    /// One viewer whose inbox never drains must not slow delivery to a
    /// viewer whose drain task keeps up.
    #[tokio::test]
    async fn stalled_viewer_does_not_delay_a_healthy_viewer() {
        let stalled = test_support::dummy_viewer().await; // drain never spawned
        let healthy = test_support::dummy_viewer().await;
        let drain = healthy.spawn_drain();

        for chunk in 0..20u8 {
            for i in 0..50u8 {
                let unit = NalUnit::from_payload(&[0x61, chunk.wrapping_mul(50).wrapping_add(i)]);
                stalled.push(unit.clone());
                healthy.push(unit);
            }
            // Give the healthy viewer's drain task room to keep its inbox
            // drained between bursts; the stalled viewer has no consumer at
            // all and saturates at `INBOX_CAPACITY`.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        healthy.cancel();
        let _ = drain.await;

        assert!(stalled.dropped_frames() > 0);
        assert_eq!(healthy.sent_frames(), 1000);
        assert_eq!(healthy.dropped_frames(), 0);
    }

    /// A viewer joining before any NAL units arrive, at 30 fps: six NAL
    /// units in a row must advance the timestamp cursor by exactly 3000 each
    /// time.
    #[tokio::test]
    async fn timestamp_cursor_advances_by_90000_over_fps_per_nal() {
        let viewer = test_support::dummy_viewer().await; // 30 fps

        let nals = [
            NalUnit::from_payload(&[0x67, 1]), // SPS
            NalUnit::from_payload(&[0x68, 2]), // PPS
            NalUnit::from_payload(&[0x65, 3]), // IDR
            NalUnit::from_payload(&[0x61, 4]), // P
            NalUnit::from_payload(&[0x61, 5]), // P
            NalUnit::from_payload(&[0x61, 6]), // P
        ];
        let expected = [3000u32, 6000, 9000, 12000, 15000, 18000];

        for (nal, want) in nals.iter().zip(expected) {
            viewer.write_nal(nal).await;
            assert_eq!(viewer.current_timestamp().await, want);
        }
    }
}
