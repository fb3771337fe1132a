//! Call control state and labels

use crate::media::LocalMediaSnapshot;

/// What the mute/camera/end controls display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    /// Microphone on
    pub mic_enabled: bool,
    /// Camera on
    pub camera_enabled: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            mic_enabled: true,
            camera_enabled: true,
        }
    }
}

impl From<&LocalMediaSnapshot> for ControlState {
    fn from(snapshot: &LocalMediaSnapshot) -> Self {
        Self {
            mic_enabled: snapshot.mic_enabled,
            camera_enabled: snapshot.camera_enabled,
        }
    }
}

impl ControlState {
    /// Label of the microphone button
    pub fn mic_label(&self) -> &'static str {
        if self.mic_enabled {
            "Mute Mic"
        } else {
            "Unmute Mic"
        }
    }

    /// Label of the camera button
    pub fn camera_label(&self) -> &'static str {
        if self.camera_enabled {
            "Camera Off"
        } else {
            "Camera On"
        }
    }

    /// Label of the end button
    pub fn end_label(&self) -> &'static str {
        "End Call"
    }
}
