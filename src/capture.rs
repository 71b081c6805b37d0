//! Camera capture collaborator
//!
//! Owns the capture sources behind local video tracks. Frame capture itself
//! is out of scope here: a source is a device binding the engine's video
//! track reads from, and this module keeps the track → source table that
//! stop / release / switch-camera operate on.

use crate::engine::EngineError;
use crate::webrtc::rtc_config::{Facing, VideoConstraints};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// A capture device bound to one video track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSource {
    pub device_id: String,
    pub facing: Facing,
}

/// Entry returned by source enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub label: String,
    pub id: String,
    pub facing: String,
    pub kind: String,
}

/// Camera / microphone collaborator used by `getUserMedia`
pub trait MediaCapture: Send + Sync {
    /// Available capture sources
    fn sources(&self) -> Vec<SourceInfo>;

    /// Bind a camera to `track_id`
    fn open_video_source(
        &self,
        track_id: &str,
        constraints: &VideoConstraints,
    ) -> Result<CaptureSource, EngineError>;

    /// Move `track_id` to the camera facing the other way. Returns the new
    /// source, or `None` when the track has no source or there is nothing to
    /// switch to.
    fn switch_camera(&self, track_id: &str) -> Option<CaptureSource>;

    /// Release the camera bound to `track_id`
    fn release_video_source(&self, track_id: &str) -> bool;
}

struct Camera {
    id: String,
    facing: Facing,
    orientation: u32,
}

/// Fixed set of cameras: even indexes face the user, odd ones face away.
pub struct VirtualCameras {
    cameras: Vec<Camera>,
    open: Mutex<HashMap<String, CaptureSource>>,
}

impl VirtualCameras {
    pub fn new(count: u32) -> Self {
        let cameras = (0..count)
            .map(|i| {
                let facing = if i % 2 == 0 { Facing::Front } else { Facing::Back };
                Camera {
                    id: i.to_string(),
                    facing,
                    orientation: if facing == Facing::Front { 270 } else { 90 },
                }
            })
            .collect();
        Self {
            cameras,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tracks currently holding a camera
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    pub fn source_for(&self, track_id: &str) -> Option<CaptureSource> {
        self.open.lock().get(track_id).cloned()
    }

    fn find(&self, constraints: &VideoConstraints) -> Option<&Camera> {
        if let Some(ref wanted) = constraints.source_id {
            if let Some(camera) = self.cameras.iter().find(|c| &c.id == wanted) {
                return Some(camera);
            }
        }
        self.cameras
            .iter()
            .find(|c| c.facing == constraints.facing)
            .or_else(|| self.cameras.first())
    }
}

fn facing_str(facing: Facing) -> &'static str {
    match facing {
        Facing::Front => "front",
        Facing::Back => "back",
    }
}

impl MediaCapture for VirtualCameras {
    fn sources(&self) -> Vec<SourceInfo> {
        let mut sources: Vec<SourceInfo> = self
            .cameras
            .iter()
            .map(|c| SourceInfo {
                label: format!(
                    "Camera {}, Facing {}, Orientation {}",
                    c.id,
                    facing_str(c.facing),
                    c.orientation
                ),
                id: c.id.clone(),
                facing: facing_str(c.facing).to_string(),
                kind: "video".to_string(),
            })
            .collect();

        sources.push(SourceInfo {
            label: "Audio".to_string(),
            id: "audio-1".to_string(),
            facing: String::new(),
            kind: "audio".to_string(),
        });
        sources
    }

    fn open_video_source(
        &self,
        track_id: &str,
        constraints: &VideoConstraints,
    ) -> Result<CaptureSource, EngineError> {
        let camera = self
            .find(constraints)
            .ok_or_else(|| EngineError::new("No camera available"))?;
        let source = CaptureSource {
            device_id: camera.id.clone(),
            facing: camera.facing,
        };
        info!("Opened camera {} for track {}", camera.id, track_id);
        self.open.lock().insert(track_id.to_string(), source.clone());
        Ok(source)
    }

    fn switch_camera(&self, track_id: &str) -> Option<CaptureSource> {
        let mut open = self.open.lock();
        let current = open.get(track_id)?;
        let wanted = match current.facing {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        };
        let Some(camera) = self.cameras.iter().find(|c| c.facing == wanted) else {
            debug!("switch_camera(): no {} camera", facing_str(wanted));
            return None;
        };
        let source = CaptureSource {
            device_id: camera.id.clone(),
            facing: camera.facing,
        };
        open.insert(track_id.to_string(), source.clone());
        info!("Track {} switched to camera {}", track_id, camera.id);
        Some(source)
    }

    fn release_video_source(&self, track_id: &str) -> bool {
        let released = self.open.lock().remove(track_id).is_some();
        if released {
            debug!("Released camera of track {}", track_id);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_list_cameras_then_audio() {
        let cameras = VirtualCameras::new(2);
        let sources = cameras.sources();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].facing, "front");
        assert_eq!(sources[1].facing, "back");
        assert_eq!(sources[1].label, "Camera 1, Facing back, Orientation 90");
        assert_eq!(sources[2].id, "audio-1");
    }

    #[test]
    fn test_open_switch_release() {
        let cameras = VirtualCameras::new(2);
        let source = cameras
            .open_video_source("t1", &VideoConstraints::default())
            .unwrap();
        assert_eq!(source.facing, Facing::Front);

        let switched = cameras.switch_camera("t1").unwrap();
        assert_eq!(switched.facing, Facing::Back);
        assert_eq!(cameras.source_for("t1"), Some(switched));

        assert!(cameras.release_video_source("t1"));
        assert!(!cameras.release_video_source("t1"));
        assert!(cameras.switch_camera("t1").is_none());
    }

    #[test]
    fn test_single_camera_cannot_switch() {
        let cameras = VirtualCameras::new(1);
        cameras
            .open_video_source("t1", &VideoConstraints::default())
            .unwrap();
        assert!(cameras.switch_camera("t1").is_none());
    }

    #[test]
    fn test_no_cameras() {
        let cameras = VirtualCameras::new(0);
        assert!(cameras
            .open_video_source("t1", &VideoConstraints::default())
            .is_err());
        assert_eq!(cameras.sources().len(), 1);
    }
}
