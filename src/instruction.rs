//! Per-output-frame composition instructions.
//!
//! The generator owns nothing but a reference to the EDL; `instruction_at` is
//! a pure function of `(edl, frame_number)`, so the stream can be restarted
//! or pre-scanned at will and two identical runs produce identical streams.

use smallvec::SmallVec;

use crate::model::{Clip, Edl, EffectSource, MappingPair, Source, TrackType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum InstructionKind {
    DrawFrame,
    GenerateColor,
    NoOp,
    Transition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum EffectKind {
    Brightness,
    Contrast,
    Saturation,
    Blur,
    Sharpen,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct Effect {
    pub kind: EffectKind,
    pub strength: f32,
    /// Piecewise-linear transfer function overriding `strength` when set.
    pub linear_mapping: Option<Vec<MappingPair>>,
}

impl Effect {
    pub fn simple(kind: EffectKind, strength: f32) -> Self {
        Effect {
            kind,
            strength,
            linear_mapping: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum TransitionKind {
    None,
    Dissolve,
    Wipe,
    Slide,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct TransitionInfo {
    pub kind: TransitionKind,
    pub duration: f32,
    /// 0 at the transition start, 1 at its end.
    pub progress: f32,
}

impl Default for TransitionInfo {
    fn default() -> Self {
        TransitionInfo {
            kind: TransitionKind::None,
            duration: 0.0,
            progress: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Geometry {
    pub pan_x: f32,
    pub pan_y: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub rotation: f32,
    pub flip: bool,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            pan_x: 0.0,
            pan_y: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            rotation: 0.0,
            flip: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

/// Everything the orchestrator needs to produce one output frame.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub track_number: i32,
    pub uri: String,
    pub source_frame: i64,
    pub geometry: Geometry,
    /// 0-1 opacity against black.
    pub fade: f32,
    pub effects: SmallVec<[Effect; 4]>,
    pub transition: TransitionInfo,
    pub color: Rgb,
}

impl Instruction {
    fn generate_color(r: f32, g: f32, b: f32) -> Self {
        Instruction {
            kind: InstructionKind::GenerateColor,
            track_number: 0,
            uri: String::new(),
            source_frame: 0,
            geometry: Geometry::default(),
            fade: 1.0,
            effects: SmallVec::new(),
            transition: TransitionInfo::default(),
            color: Rgb { r, g, b },
        }
    }

    fn noop() -> Self {
        Instruction {
            kind: InstructionKind::NoOp,
            ..Instruction::generate_color(0.0, 0.0, 0.0)
        }
    }
}

/// Lazily derives the instruction stream from an immutable EDL.
pub struct InstructionGenerator<'a> {
    edl: &'a Edl,
    total_frames: i64,
}

/// The default video track instructions are synthesized from.
const MAIN_TRACK: i32 = 1;

impl<'a> InstructionGenerator<'a> {
    pub fn new(edl: &'a Edl) -> Self {
        let total_frames = edl.total_frames();
        tracing::info!(total_frames, fps = edl.fps, "instruction generator initialized");
        InstructionGenerator { edl, total_frames }
    }

    pub fn total_frames(&self) -> i64 {
        self.total_frames
    }

    /// A finite restartable sequence of `total_frames` instructions.
    pub fn iter(&self) -> Instructions<'_> {
        Instructions {
            generator: self,
            frame: 0,
        }
    }

    /// Pure synthesis of the instruction for one output frame.
    pub fn instruction_at(&self, frame: i64) -> Instruction {
        let frame_time = self.edl.frame_to_time(frame);

        let Some(clip) = self.find_main_clip(frame_time) else {
            return Instruction::generate_color(0.0, 0.0, 0.0);
        };

        if clip.is_null {
            return Instruction::generate_color(0.0, 0.0, 0.0);
        }

        let mut instruction = match &clip.source {
            Source::Media(media) => {
                let source_fps = media.fps.unwrap_or(self.edl.fps);
                let position = frame_time - clip.time_in;
                // Nudged above the boundary so an exact frame time floors to
                // its own frame rather than the one before it.
                let source_frame =
                    ((media.source_in + position) * source_fps as f64 + 1e-6).floor() as i64;
                Instruction {
                    kind: InstructionKind::DrawFrame,
                    track_number: clip.track.number,
                    uri: media.uri.clone(),
                    source_frame,
                    geometry: Geometry {
                        pan_x: clip.motion.pan_x as f32,
                        pan_y: clip.motion.pan_y as f32,
                        zoom_x: clip.motion.zoom_x as f32,
                        zoom_y: clip.motion.zoom_y as f32,
                        rotation: clip.motion.rotation as f32,
                        flip: media.flip,
                    },
                    fade: 1.0,
                    effects: SmallVec::new(),
                    transition: TransitionInfo::default(),
                    color: Rgb::default(),
                }
            }
            Source::Generate(_) => {
                // Only black generation is accepted at parse time.
                let mut i = Instruction::generate_color(0.0, 0.0, 0.0);
                i.track_number = clip.track.number;
                i.source_frame = frame;
                i
            }
            Source::Effect(_) | Source::Transform(_) | Source::Subtitle(_) => Instruction::noop(),
            Source::Null => Instruction::generate_color(0.0, 0.0, 0.0),
        };

        if instruction.kind != InstructionKind::DrawFrame {
            return instruction;
        }

        instruction.fade = compute_fade(clip, frame_time);

        if let Some(transition) = &clip.transition {
            let position = frame_time - clip.time_in;
            if transition.duration > 0.0 && position < transition.duration {
                let kind = match transition.kind.as_str() {
                    "dissolve" => TransitionKind::Dissolve,
                    "wipe" => TransitionKind::Wipe,
                    "slide" => TransitionKind::Slide,
                    _ => TransitionKind::None,
                };
                if kind != TransitionKind::None {
                    instruction.transition = TransitionInfo {
                        kind,
                        duration: transition.duration as f32,
                        progress: (position / transition.duration) as f32,
                    };
                }
            }
        }

        for effect in &clip.effects {
            if let Some(kind) = effect_kind_from_name(&effect.kind) {
                instruction
                    .effects
                    .push(Effect::simple(kind, effect.strength));
            } else {
                tracing::debug!(kind = %effect.kind, "ignoring unknown inline effect");
            }
        }

        self.gather_track_effects(clip, frame_time, &mut instruction);

        instruction
    }

    /// The active clip on the main video track at `frame_time`. The organized
    /// track view is preferred; the raw clip list is the fallback when track
    /// alignment has not produced one.
    fn find_main_clip(&self, frame_time: f64) -> Option<&Clip> {
        let key = format!("video_{MAIN_TRACK}");
        if let Some(track) = self.edl.tracks.get(&key) {
            return track.iter().find(|c| c.contains(frame_time));
        }

        self.edl.clips.iter().find(|c| {
            c.track.kind == TrackType::Video
                && c.track.number == MAIN_TRACK
                && c.track.subtype.is_empty()
                && c.contains(frame_time)
        })
    }

    /// Appends effects from any `fx_N` track applying to the clip's parent
    /// video track and active at `frame_time`.
    fn gather_track_effects(&self, clip: &Clip, frame_time: f64, instruction: &mut Instruction) {
        let Ok(parent_key) = clip.track.key() else {
            return;
        };

        for (fx_key, applies_to) in &self.edl.fx_applies_to {
            if applies_to != &parent_key {
                continue;
            }
            let Some(fx_track) = self.edl.tracks.get(fx_key) else {
                continue;
            };
            let Some(fx_clip) = fx_track
                .iter()
                .find(|c| !c.is_null && c.contains(frame_time))
            else {
                continue;
            };
            let Source::Effect(effect_source) = &fx_clip.source else {
                continue;
            };

            self.append_effect_source(effect_source, fx_clip, frame_time, instruction);
        }
    }

    fn append_effect_source(
        &self,
        source: &EffectSource,
        fx_clip: &Clip,
        frame_time: f64,
        instruction: &mut Instruction,
    ) {
        if let Some(value) = source.value {
            if let Some(kind) = effect_kind_from_name(&source.kind) {
                instruction
                    .effects
                    .push(Effect::simple(kind, value as f32));
            }
        }

        // Filter extension: a transfer function sampled at control points over
        // the clip's local time, interpolated pairwise for this frame.
        let position = frame_time - fx_clip.time_in;
        for filter in &source.filters {
            let Some(kind) = effect_kind_from_name(&filter.kind) else {
                continue;
            };
            if let Some(mapping) = interpolate_mapping(&filter.control_points, position) {
                instruction.effects.push(Effect {
                    kind,
                    strength: 1.0,
                    linear_mapping: Some(mapping),
                });
            }
        }
    }
}

fn effect_kind_from_name(name: &str) -> Option<EffectKind> {
    match name {
        "brightness" => Some(EffectKind::Brightness),
        "contrast" => Some(EffectKind::Contrast),
        "saturation" => Some(EffectKind::Saturation),
        "blur" => Some(EffectKind::Blur),
        "sharpen" => Some(EffectKind::Sharpen),
        _ => None,
    }
}

fn compute_fade(clip: &Clip, frame_time: f64) -> f32 {
    let duration = clip.duration();
    let position = frame_time - clip.time_in;

    let mut fade = 1.0f64;

    if clip.top_fade > 0.0 && position < clip.top_fade {
        fade = position / clip.top_fade;
    }

    if clip.tail_fade > 0.0 && position > duration - clip.tail_fade {
        fade = fade.min((duration - position) / clip.tail_fade);
    }

    fade.clamp(0.0, 1.0) as f32
}

/// Linearly interpolates a filter's mapping between the control points that
/// surround `position` (seconds into the clip). Outside the sampled range the
/// nearest control point wins.
fn interpolate_mapping(
    control_points: &[crate::model::FilterControlPoint],
    position: f64,
) -> Option<Vec<MappingPair>> {
    match control_points {
        [] => None,
        [only] => Some(only.mapping.clone()),
        points => {
            let first = points.first().unwrap();
            let last = points.last().unwrap();
            if position <= first.time {
                return Some(first.mapping.clone());
            }
            if position >= last.time {
                return Some(last.mapping.clone());
            }

            let next_index = points.iter().position(|cp| cp.time > position)?;
            let prev = &points[next_index - 1];
            let next = &points[next_index];

            let span = next.time - prev.time;
            if span <= f64::EPSILON || prev.mapping.len() != next.mapping.len() {
                return Some(prev.mapping.clone());
            }
            let alpha = ((position - prev.time) / span) as f32;

            Some(
                prev.mapping
                    .iter()
                    .zip(&next.mapping)
                    .map(|(p, n)| MappingPair {
                        src: p.src + (n.src - p.src) * alpha,
                        dst: p.dst + (n.dst - p.dst) * alpha,
                    })
                    .collect(),
            )
        }
    }
}

/// Thin stateless iterator over the generator.
pub struct Instructions<'a> {
    generator: &'a InstructionGenerator<'a>,
    frame: i64,
}

impl Iterator for Instructions<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        if self.frame >= self.generator.total_frames {
            return None;
        }
        let instruction = self.generator.instruction_at(self.frame);
        self.frame += 1;
        Some(instruction)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.generator.total_frames - self.frame).max(0) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Instructions<'_> {}
