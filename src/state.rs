//! Process-wide shared state handed to every HTTP handler.

use std::sync::Arc;

use crate::camera::CameraSource;
use crate::config::ServerConfig;
use crate::keyframe::KeyframeCache;
use crate::recorder::Recorder;
use crate::registry::ViewerRegistry;

pub struct AppState {
    pub config: ServerConfig,
    pub camera: Arc<CameraSource>,
    pub keyframe_cache: Arc<KeyframeCache>,
    pub registry: Arc<ViewerRegistry>,
    pub recorder: Arc<Recorder>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        camera: Arc<CameraSource>,
        keyframe_cache: Arc<KeyframeCache>,
        registry: Arc<ViewerRegistry>,
        recorder: Arc<Recorder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            camera,
            keyframe_cache,
            registry,
            recorder,
        })
    }
}
