//! cam-core - H.264 camera ingest, fan-out, and per-viewer WebRTC pacing engine.
//!
//! Reads a raw H.264 Annex-B byte stream from a camera subprocess, frames it
//! into NAL units, caches parameter sets and the latest keyframe, and
//! dispatches the stream to an unbounded set of independent WebRTC viewers
//! under strict non-blocking backpressure. An optional recorder shares the
//! same NAL ingest path to produce muxed recordings on disk.

pub mod broadcaster;
pub mod camera;
pub mod config;
pub mod dropqueue;
pub mod error;
pub mod keyframe;
pub mod nal;
pub mod recorder;
pub mod registry;
pub mod signaling;
pub mod state;
pub mod utils;
pub mod viewer;
pub mod web;

pub use error::{AppError, Result};
