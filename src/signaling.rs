//! Signaling adapter: turns an SDP offer into a registered [`Viewer`] bound
//! to a fresh WebRTC peer connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::{AppError, Result};
use crate::keyframe::KeyframeCache;
use crate::registry::ViewerRegistry;
use crate::viewer::{h264_codec_capability, Viewer};

/// Bound on ICE gathering before answering with whatever candidates were
/// collected so far; trickle ICE is disabled, so the client only ever sees
/// one answer with all candidates embedded in the SDP.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    #[serde(rename = "type")]
    pub sdp_type: &'static str,
    pub sdp: String,
}

/// Handles one `POST /offer`: allocates a peer connection and video track,
/// negotiates, registers the resulting viewer, and returns the SDP answer.
pub async fn handle_offer(
    req: OfferRequest,
    registry: Arc<ViewerRegistry>,
    keyframe_cache: Arc<KeyframeCache>,
    framerate: u32,
) -> Result<AnswerResponse> {
    if req.sdp_type != "offer" {
        return Err(AppError::MalformedOffer(format!(
            "expected type \"offer\", got {:?}",
            req.sdp_type
        )));
    }

    let pc = Arc::new(new_peer_connection().await?);

    let track = Arc::new(TrackLocalStaticRTP::new(
        h264_codec_capability(),
        "video0".to_string(),
        "one-kvm".to_string(),
    ));
    if let Err(e) = pc.add_track(track.clone()).await {
        let _ = pc.close().await;
        return Err(AppError::SignalingFailed(format!("failed to add video track: {e}")));
    }

    let (state_tx, state_rx) = watch::channel(RTCPeerConnectionState::New);
    let viewer = Viewer::new(pc.clone(), track, framerate, state_rx);

    install_handlers(&pc, viewer.clone(), registry.clone(), state_tx);

    if let Err(e) = negotiate(&pc, &req.sdp).await {
        let _ = pc.close().await;
        return Err(e);
    }

    registry.add(viewer, &keyframe_cache).await;

    let local_desc = pc.local_description().await.ok_or_else(|| {
        AppError::SignalingFailed("missing local description after negotiation".to_string())
    })?;

    Ok(AnswerResponse {
        sdp_type: "answer",
        sdp: local_desc.sdp,
    })
}

async fn new_peer_connection() -> Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| AppError::SignalingFailed(format!("failed to register codecs: {e}")))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| AppError::SignalingFailed(format!("failed to register interceptors: {e}")))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    // Empty ICE server list: acceptable for LAN deployment per this service's scope.
    api.new_peer_connection(RTCConfiguration::default())
        .await
        .map_err(|e| AppError::SignalingFailed(format!("failed to create peer connection: {e}")))
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    viewer: Arc<Viewer>,
    registry: Arc<ViewerRegistry>,
    state_tx: watch::Sender<RTCPeerConnectionState>,
) {
    {
        let viewer = viewer.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let viewer = viewer.clone();
            Box::pin(async move {
                info!(viewer = %viewer.id, label = %dc.label(), "data channel opened");
                viewer.set_data_channel(dc).await;
            })
        }));
    }

    {
        let viewer_id = viewer.id;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let registry = registry.clone();
            let state_tx = state_tx.clone();
            Box::pin(async move {
                let _ = state_tx.send(s);
                info!(viewer = %viewer_id, state = ?s, "peer connection state changed");
                if matches!(
                    s,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    registry.remove(viewer_id).await;
                }
            })
        }));
    }

    // Trickle ICE is disabled: all candidates are embedded in the SDP answer,
    // so this handler only logs.
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        Box::pin(async move {
            if let Some(c) = candidate {
                debug!(candidate = %c.to_json().map(|j| j.candidate).unwrap_or_default(), "ICE candidate gathered");
            }
        })
    }));
}

async fn negotiate(pc: &Arc<RTCPeerConnection>, offer_sdp: &str) -> Result<()> {
    let offer = RTCSessionDescription::offer(offer_sdp.to_string())
        .map_err(|e| AppError::MalformedOffer(format!("invalid SDP offer: {e}")))?;

    pc.set_remote_description(offer)
        .await
        .map_err(|e| AppError::SignalingFailed(format!("failed to set remote description: {e}")))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| AppError::SignalingFailed(format!("failed to create answer: {e}")))?;

    let mut gather_complete = pc.gathering_complete_promise().await;

    pc.set_local_description(answer)
        .await
        .map_err(|e| AppError::SignalingFailed(format!("failed to set local description: {e}")))?;

    if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
        .await
        .is_err()
    {
        warn!("ICE gathering timed out after {:?}; answering with partial candidates", ICE_GATHER_TIMEOUT);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_offer_type() {
        let registry = Arc::new(ViewerRegistry::new());
        let cache = Arc::new(KeyframeCache::new());
        let req = OfferRequest {
            sdp_type: "answer".to_string(),
            sdp: String::new(),
        };
        let result = handle_offer(req, registry, cache, 30).await;
        assert!(matches!(result, Err(AppError::MalformedOffer(_))));
    }

    #[tokio::test]
    async fn rejects_malformed_sdp_body() {
        let registry = Arc::new(ViewerRegistry::new());
        let cache = Arc::new(KeyframeCache::new());
        let req = OfferRequest {
            sdp_type: "offer".to_string(),
            sdp: "not a real sdp".to_string(),
        };
        let result = handle_offer(req, registry.clone(), cache, 30).await;
        assert!(result.is_err());
        // No viewer should have been registered on failure.
        assert!(registry.is_empty().await);
    }
}
