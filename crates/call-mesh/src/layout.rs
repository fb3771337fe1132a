//! Video tile layout

use std::collections::HashMap;

use crate::media::{LocalMediaSnapshot, RemoteStream};
use crate::peer::RemoteStreams;

/// Badge shown on the local tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    /// Microphone muted
    MicOff,
    /// Camera disabled
    CameraOff,
}

impl Badge {
    /// Display text
    pub fn label(&self) -> &'static str {
        match self {
            Badge::MicOff => "Mic Off",
            Badge::CameraOff => "Camera Off",
        }
    }
}

/// Where a tile sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilePlacement {
    /// Cell of the group grid
    Grid,
    /// Full-size tile of a direct call
    Primary,
    /// Small overlay on top of the primary tile
    Floating,
}

/// One rendered video tile
#[derive(Debug, Clone)]
pub struct VideoTile {
    /// Participant id
    pub participant_id: String,
    /// Caption
    pub label: String,
    /// Local playback is always muted to avoid echo
    pub muted: bool,
    /// Whether this is the local tile
    pub is_local: bool,
    /// Badges on the tile
    pub badges: Vec<Badge>,
    /// Stream to show; `None` renders an empty tile
    pub stream_id: Option<String>,
    /// Position
    pub placement: TilePlacement,
}

/// Everything needed to lay out the tiles
pub struct LayoutInput<'a> {
    /// Local participant id
    pub local_id: &'a str,
    /// Local display name
    pub local_name: &'a str,
    /// Local media state
    pub local: &'a LocalMediaSnapshot,
    /// Remote streams keyed by participant id
    pub remotes: &'a RemoteStreams,
    /// Display names by participant id
    pub names: &'a HashMap<String, String>,
    /// One-to-one call
    pub direct: bool,
}

/// Build the tile list
///
/// Group calls put the local tile first, then remotes ordered by id. Direct
/// calls show the first remote as primary with the local tile floating, or
/// the local tile as primary while nobody else is there.
pub fn compose_layout(input: &LayoutInput<'_>) -> Vec<VideoTile> {
    let remotes: Vec<VideoTile> = input
        .remotes
        .iter()
        .map(|(id, stream)| remote_tile(id, stream, input.names))
        .collect();

    if !input.direct {
        let mut tiles = Vec::with_capacity(remotes.len() + 1);
        tiles.push(local_tile(input, TilePlacement::Grid));
        tiles.extend(remotes);
        return tiles;
    }

    match remotes.into_iter().next() {
        Some(mut primary) => {
            primary.placement = TilePlacement::Primary;
            vec![primary, local_tile(input, TilePlacement::Floating)]
        }
        None => vec![local_tile(input, TilePlacement::Primary)],
    }
}

fn local_tile(input: &LayoutInput<'_>, placement: TilePlacement) -> VideoTile {
    let mut badges = Vec::new();
    if !input.local.mic_enabled {
        badges.push(Badge::MicOff);
    }
    if !input.local.camera_enabled {
        badges.push(Badge::CameraOff);
    }
    VideoTile {
        participant_id: input.local_id.to_string(),
        label: format!("{} (You)", input.local_name),
        muted: true,
        is_local: true,
        badges,
        stream_id: input.local.stream.as_ref().map(|s| s.id().to_string()),
        placement,
    }
}

fn remote_tile(id: &str, stream: &RemoteStream, names: &HashMap<String, String>) -> VideoTile {
    VideoTile {
        participant_id: id.to_string(),
        label: names.get(id).cloned().unwrap_or_else(|| id.to_string()),
        muted: false,
        is_local: false,
        badges: Vec::new(),
        stream_id: Some(stream.stream_id.clone()),
        placement: TilePlacement::Grid,
    }
}
