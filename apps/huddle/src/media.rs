use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// One outgoing track. The RTP sink is shared by every peer transport the
/// track is attached to; producers feed it through [`LocalTrack::write_sample`].
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    sink: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn sink(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.sink.as_ref()
    }

    /// Fans `sample` out to every transport carrying this track. Returns
    /// `false` when it was dropped: the track is disabled (muted, camera
    /// off) or has no RTP sink.
    pub async fn write_sample(&self, sample: &Sample) -> MeshResult<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let Some(sink) = &self.sink else {
            return Ok(false);
        };
        sink.write_sample(sample)
            .await
            .map_err(|err| MeshError::Media(format!("{} track: {err}", self.id)))?;
        Ok(true)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// The local media source handle: read-only fan-out to every transport.
#[derive(Debug)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    /// An Opus microphone track and a VP8 camera track backed by webrtc-rs
    /// sample sinks.
    pub fn audio_video(stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.clone(),
        );
        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.clone(),
        );
        Self {
            stream_id,
            tracks: vec![
                LocalTrack::with_sink("audio", MediaKind::Audio, Arc::new(audio)),
                LocalTrack::with_sink("video", MediaKind::Video, Arc::new(video)),
            ],
        }
    }

    /// Track descriptors without RTP sinks, for in-memory transports.
    pub fn detached(stream_id: impl Into<String>, kinds: &[MediaKind]) -> Self {
        let tracks = kinds
            .iter()
            .map(|kind| LocalTrack {
                id: match kind {
                    MediaKind::Audio => "audio".to_owned(),
                    MediaKind::Video => "video".to_owned(),
                },
                kind: *kind,
                enabled: AtomicBool::new(true),
                sink: None,
            })
            .collect();
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Flips every track of `kind`; returns how many tracks were touched.
    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) -> usize {
        let mut touched = 0;
        for track in self.tracks.iter().filter(|track| track.kind == kind) {
            track.enabled.store(enabled, Ordering::Relaxed);
            touched += 1;
        }
        touched
    }
}

impl LocalTrack {
    fn with_sink(id: &str, kind: MediaKind, sink: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            id: id.to_owned(),
            kind,
            enabled: AtomicBool::new(true),
            sink: Some(sink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn toggles_only_touch_matching_kind() {
        let media = LocalMedia::detached("local", &[MediaKind::Audio, MediaKind::Video]);
        assert_eq!(media.set_enabled(MediaKind::Video, false), 1);

        let video = media
            .tracks()
            .iter()
            .find(|t| t.kind() == MediaKind::Video)
            .expect("video track");
        let audio = media
            .tracks()
            .iter()
            .find(|t| t.kind() == MediaKind::Audio)
            .expect("audio track");
        assert!(!video.is_enabled());
        assert!(audio.is_enabled());
    }

    #[tokio::test]
    async fn disabled_tracks_drop_samples() {
        let media = LocalMedia::audio_video("cam-1");
        let sample = Sample {
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        let audio = &media.tracks()[0];
        assert!(audio.write_sample(&sample).await.expect("write"));

        media.set_enabled(MediaKind::Audio, false);
        assert!(!audio.write_sample(&sample).await.expect("muted"));
        media.set_enabled(MediaKind::Audio, true);
        assert!(audio.write_sample(&sample).await.expect("unmuted"));

        let detached = LocalMedia::detached("s", &[MediaKind::Video]);
        assert!(!detached.tracks()[0].write_sample(&sample).await.expect("no sink"));
    }

    #[test]
    fn audio_video_tracks_share_stream_id() {
        let media = LocalMedia::audio_video("cam-1");
        assert_eq!(media.tracks().len(), 2);
        for track in media.tracks() {
            let sink = track.sink().expect("rtp sink");
            assert_eq!(sink.stream_id(), "cam-1");
        }
    }
}
