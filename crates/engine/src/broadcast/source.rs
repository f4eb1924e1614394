//! Local media source handles

use serde::Serialize;

/// Track media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// One capture track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaTrack {
    /// Stable track id; engines key their outgoing tracks by it
    pub id: String,
    pub kind: TrackKind,
    /// Human-readable label (display name, device name)
    pub label: String,
}

impl MediaTrack {
    pub fn video(label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: TrackKind::Video,
            label: label.into(),
        }
    }

    pub fn audio(label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: TrackKind::Audio,
            label: label.into(),
        }
    }
}

/// Opaque local stream: a set of tracks attached to sessions together
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaSource {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaSource {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_tracks().next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Merge the video tracks of one source with the audio tracks of another
    ///
    /// Returns `None` when the result would carry no tracks.
    pub fn combine(video: Option<&MediaSource>, audio: Option<&MediaSource>) -> Option<MediaSource> {
        let tracks: Vec<MediaTrack> = video
            .into_iter()
            .flat_map(|s| s.video_tracks().cloned())
            .chain(audio.into_iter().flat_map(|s| s.audio_tracks().cloned()))
            .collect();

        if tracks.is_empty() {
            None
        } else {
            Some(MediaSource::new(tracks))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_takes_video_and_audio() {
        let display = MediaSource::new(vec![MediaTrack::video("Display 1"), MediaTrack::audio("tab audio")]);
        let mic = MediaSource::new(vec![MediaTrack::audio("Built-in Microphone")]);

        let combined = MediaSource::combine(Some(&display), Some(&mic)).unwrap();
        assert_eq!(combined.tracks.len(), 2);
        assert_eq!(combined.video_tracks().next().unwrap().label, "Display 1");
        assert_eq!(combined.audio_tracks().next().unwrap().label, "Built-in Microphone");
    }

    #[test]
    fn test_combine_empty() {
        assert!(MediaSource::combine(None, None).is_none());

        let mic_only = MediaSource::new(vec![MediaTrack::audio("mic")]);
        // Audio tracks of the video source are not used
        assert!(MediaSource::combine(Some(&mic_only), None).is_none());
    }
}
