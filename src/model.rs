use std::collections::BTreeMap;

use crate::error::{RenderError, RenderResult};

/// A fully parsed and normalized edit decision list.
///
/// `clips` holds every clip in document order; `tracks` holds the same clips
/// grouped by track key with null clips filling gaps, so every track spans
/// `[0, duration]`. Both views are built once by the parser and immutable
/// afterwards.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Edl {
    pub fps: i32,
    pub width: i32,
    pub height: i32,
    pub clips: Vec<Clip>,
    pub tracks: BTreeMap<String, Vec<Clip>>,
    /// Maps renamed effects tracks (`fx_N`) to the video track they apply to.
    pub fx_applies_to: BTreeMap<String, String>,
    /// Global duration in seconds: the latest `out` across all tracks.
    pub duration: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum TrackType {
    Video,
    Audio,
    Subtitle,
    Caption,
    Burnin,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Track {
    pub kind: TrackType,
    pub number: i32,
    pub subtype: String,
    pub subnumber: i32,
}

impl Track {
    pub fn video(number: i32) -> Self {
        Track {
            kind: TrackType::Video,
            number,
            subtype: String::new(),
            subnumber: 1,
        }
    }

    /// Stable grouping key for track alignment. Effects tracks get a
    /// placeholder key that the normalizer later renames to `fx_N`.
    pub fn key(&self) -> RenderResult<String> {
        match self.kind {
            TrackType::Video => match self.subtype.as_str() {
                "effects" => Ok(format!("_effects_{}_{}", self.number, self.subnumber)),
                "transform" | "colour" => Ok(format!("video_{}_{}", self.number, self.subtype)),
                "" => Ok(format!("video_{}", self.number)),
                other => Err(RenderError::invalid_edl(format!(
                    "unknown video track subtype '{other}'"
                ))),
            },
            TrackType::Audio => match self.subtype.as_str() {
                "level" | "pan" => Ok(format!("audio_{}_{}", self.number, self.subtype)),
                "" => Ok(format!("audio_{}", self.number)),
                other => Err(RenderError::invalid_edl(format!(
                    "unknown audio track subtype '{other}'"
                ))),
            },
            TrackType::Subtitle | TrackType::Burnin => {
                let type_str = if self.kind == TrackType::Subtitle {
                    "subtitle"
                } else {
                    "burnin"
                };
                match self.subtype.as_str() {
                    "transform" => Ok(format!("{type_str}_{}_transform", self.number)),
                    "" => Ok(format!("{type_str}_{}", self.number)),
                    other => Err(RenderError::invalid_edl(format!(
                        "unknown {type_str} track subtype '{other}'"
                    ))),
                }
            }
            TrackType::Caption => Err(RenderError::invalid_edl(
                "caption tracks have no track key",
            )),
        }
    }
}

/// One timeline interval on a track.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Clip {
    /// Timeline position in seconds.
    pub time_in: f64,
    pub time_out: f64,
    pub track: Track,
    pub source: Source,
    pub top_fade: f64,
    pub tail_fade: f64,
    pub top_fade_yuv: f64,
    pub tail_fade_yuv: f64,
    pub sync: f64,
    pub motion: Motion,
    pub transition: Option<Transition>,
    pub text_format: Option<TextFormat>,
    pub channel_map: BTreeMap<u32, f64>,
    pub effects: Vec<SimpleEffect>,
    /// Synthesized gap filler inserted by track alignment.
    pub is_null: bool,
}

impl Clip {
    /// A gap-filling clip producing black for `[time_in, time_out)`.
    pub fn null(time_in: f64, time_out: f64, track: Track) -> Self {
        Clip {
            time_in,
            time_out,
            track,
            source: Source::Null,
            top_fade: 0.0,
            tail_fade: 0.0,
            top_fade_yuv: 0.0,
            tail_fade_yuv: 0.0,
            sync: 0.0,
            motion: Motion::default(),
            transition: None,
            text_format: None,
            channel_map: BTreeMap::new(),
            effects: Vec::new(),
            is_null: true,
        }
    }

    pub fn duration(&self) -> f64 {
        self.time_out - self.time_in
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.time_in && time < self.time_out
    }
}

/// Where a clip's pixels come from.
#[derive(Clone, Debug, serde::Serialize)]
pub enum Source {
    Media(MediaSource),
    Generate(GenerateSource),
    Effect(EffectSource),
    Transform(TransformSource),
    Subtitle(SubtitleSource),
    /// Gap filler; produces black.
    Null,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct MediaSource {
    pub uri: String,
    /// Source timecode window, in seconds.
    pub source_in: f64,
    pub source_out: f64,
    pub track_id: String,
    pub width: i32,
    pub height: i32,
    /// Source frame rate; falls back to the EDL fps when absent.
    pub fps: Option<i32>,
    pub speed: f64,
    pub gamma: f64,
    pub audiomix: f64,
    pub flip: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum GenerateKind {
    Black,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct GenerateSource {
    pub kind: GenerateKind,
    pub source_in: f64,
    pub source_out: f64,
    pub width: i32,
    pub height: i32,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct EffectSource {
    /// Effect name, e.g. "brightness", "contrast", "saturation".
    pub kind: String,
    pub source_in: f64,
    pub source_out: f64,
    /// Scalar strength for simple effects.
    pub value: Option<f64>,
    /// Time-varying transfer functions keyed by effect kind.
    pub filters: Vec<EffectFilter>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct EffectFilter {
    pub kind: String,
    pub control_points: Vec<FilterControlPoint>,
}

/// A transfer function sampled at one point in time. Between control points
/// the mapping is interpolated pairwise.
#[derive(Clone, Debug, serde::Serialize)]
pub struct FilterControlPoint {
    pub time: f64,
    pub mapping: Vec<MappingPair>,
}

/// One `(src, dst)` sample of a piecewise-linear transfer function, both
/// normalized to `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct MappingPair {
    pub src: f32,
    pub dst: f32,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct TransformSource {
    pub source_in: f64,
    pub source_out: f64,
    pub control_points: Vec<ShapeControlPoint>,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ShapeControlPoint {
    pub point: f64,
    pub pan_x: f64,
    pub pan_y: f64,
    pub zoom_x: f64,
    pub zoom_y: f64,
    pub rotate: f64,
    pub shape: String,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SubtitleSource {
    /// May be absent for gaps inside multi-part subtitle clips.
    pub text: Option<String>,
    pub source_in: f64,
    pub source_out: f64,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Motion {
    /// -1 to 1.
    pub pan_x: f64,
    pub pan_y: f64,
    pub zoom_x: f64,
    pub zoom_y: f64,
    /// Degrees.
    pub rotation: f64,
    pub offset: f64,
    pub duration: f64,
}

impl Default for Motion {
    fn default() -> Self {
        Motion {
            pan_x: 0.0,
            pan_y: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            rotation: 0.0,
            offset: 0.0,
            duration: 0.0,
        }
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct Transition {
    /// "dissolve", "wipe", "slide".
    pub kind: String,
    pub duration: f64,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct TextFormat {
    pub font: String,
    pub font_size: f64,
    pub halign: String,
    pub valign: String,
    pub text_ayuv: String,
    pub back_ayuv: String,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SimpleEffect {
    pub kind: String,
    pub strength: f32,
}

impl Edl {
    /// Frame duration in seconds.
    pub fn frame_duration(&self) -> f64 {
        1.0 / self.fps as f64
    }

    pub fn frame_to_time(&self, frame: i64) -> f64 {
        frame as f64 / self.fps as f64
    }

    pub fn time_to_frame(&self, time: f64) -> i64 {
        (time * self.fps as f64).round() as i64
    }

    /// Total output frames derived from the latest clip out point.
    pub fn total_frames(&self) -> i64 {
        let max_out = self.clips.iter().map(|c| c.time_out).fold(0.0f64, f64::max);
        self.time_to_frame(max_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_keys_follow_type_and_subtype() {
        assert_eq!(Track::video(1).key().unwrap(), "video_1");

        let fx = Track {
            kind: TrackType::Video,
            number: 2,
            subtype: "effects".to_string(),
            subnumber: 1,
        };
        assert_eq!(fx.key().unwrap(), "_effects_2_1");

        let level = Track {
            kind: TrackType::Audio,
            number: 3,
            subtype: "level".to_string(),
            subnumber: 1,
        };
        assert_eq!(level.key().unwrap(), "audio_3_level");
    }

    #[test]
    fn unknown_subtype_is_rejected() {
        let t = Track {
            kind: TrackType::Video,
            number: 1,
            subtype: "sparkle".to_string(),
            subnumber: 1,
        };
        assert!(t.key().is_err());
    }

    #[test]
    fn frame_time_roundtrip_at_30fps() {
        let edl = Edl {
            fps: 30,
            width: 1920,
            height: 1080,
            clips: Vec::new(),
            tracks: BTreeMap::new(),
            fx_applies_to: BTreeMap::new(),
            duration: 0.0,
        };
        assert_eq!(edl.time_to_frame(1.0), 30);
        assert!((edl.frame_to_time(30) - 1.0).abs() < 1e-12);
        assert_eq!(edl.time_to_frame(2.9999999), 90);
    }

    #[test]
    fn null_clip_spans_and_marks() {
        let c = Clip::null(1.0, 2.5, Track::video(1));
        assert!(c.is_null);
        assert!(c.contains(1.0));
        assert!(c.contains(2.4999));
        assert!(!c.contains(2.5));
        assert!((c.duration() - 1.5).abs() < 1e-12);
    }
}
