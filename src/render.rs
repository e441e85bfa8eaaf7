//! The render orchestrator: instruction stream in, encoded file out.
//!
//! Frames flow strictly in order through decode → composite → encode; the
//! only branching is the per-frame choice between the CPU path and the
//! zero-copy GPU passthrough.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;

use crate::compositor::Compositor;
use crate::decode::{Decoder, DecoderConfig};
use crate::encode::{Encoder, EncoderConfig};
use crate::error::{RenderError, RenderResult};
use crate::hwaccel;
use crate::instruction::{Instruction, InstructionGenerator, InstructionKind, TransitionKind};
use crate::model::{Edl, Source, TrackType};

const CPU_EPSILON: f32 = 1e-3;

#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    /// Directory media URIs resolve against (usually the EDL's directory).
    pub media_root: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderStats {
    pub frames_written: u64,
    pub elapsed: Duration,
    pub avg_fps: f64,
}

/// True when an instruction cannot ride the GPU passthrough: anything that
/// modifies pixels has to go through the compositor.
pub fn requires_cpu_processing(instruction: &Instruction) -> bool {
    if !instruction.effects.is_empty() {
        return true;
    }
    if instruction.fade < 1.0 {
        return true;
    }

    let g = &instruction.geometry;
    if g.pan_x.abs() > CPU_EPSILON
        || g.pan_y.abs() > CPU_EPSILON
        || (g.zoom_x - 1.0).abs() > CPU_EPSILON
        || (g.zoom_y - 1.0).abs() > CPU_EPSILON
        || g.rotation.abs() > CPU_EPSILON
        || g.flip
    {
        return true;
    }

    if instruction.transition.kind != TransitionKind::None {
        return true;
    }

    instruction.kind != InstructionKind::DrawFrame
}

/// Mirrors the CLI contract for URIs: an existing path wins, then a path
/// relative to the EDL's directory, then the URI handed to libav verbatim.
pub fn resolve_media_uri(uri: &str, media_root: Option<&Path>) -> PathBuf {
    let direct = PathBuf::from(uri);
    if direct.exists() {
        return direct;
    }
    if let Some(root) = media_root {
        let joined = root.join(uri);
        if joined.exists() {
            return joined;
        }
    }
    direct
}

pub struct Renderer<'a> {
    edl: &'a Edl,
    decoders: HashMap<String, Decoder>,
    compositor: Compositor,
    encoder: Encoder,
    hardware_used: bool,
}

impl<'a> Renderer<'a> {
    pub fn new(edl: &'a Edl, output: impl AsRef<Path>, options: RenderOptions) -> RenderResult<Self> {
        let hw_requested = options.decoder.use_hardware || options.encoder.use_hardware;
        let shared_context = if hw_requested {
            match hwaccel::shared_context(&options.encoder.hw) {
                Ok(context) => {
                    tracing::info!("shared hardware context ready for GPU passthrough");
                    Some(context)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "no shared hardware context, components will create their own"
                    );
                    None
                }
            }
        } else {
            None
        };

        // One decoder per unique media URI across all video clips.
        let mut decoders = HashMap::new();
        for clip in &edl.clips {
            if clip.track.kind != TrackType::Video {
                continue;
            }
            let Source::Media(media) = &clip.source else {
                continue;
            };
            if decoders.contains_key(&media.uri) {
                continue;
            }

            let path = resolve_media_uri(&media.uri, options.media_root.as_deref());
            tracing::info!(uri = %media.uri, path = %path.display(), "loading media");
            let decoder = Decoder::open(&path, &options.decoder, shared_context.as_ref())?;
            decoders.insert(media.uri.clone(), decoder);
        }

        let encoder = Encoder::open(output, options.encoder, shared_context.as_ref())?;

        let compositor = Compositor::new(edl.width as u32, edl.height as u32, Pixel::YUV420P);

        let hardware_used =
            encoder.is_using_hardware() || decoders.values().any(Decoder::is_using_hardware);

        Ok(Renderer {
            edl,
            decoders,
            compositor,
            encoder,
            hardware_used,
        })
    }

    pub fn run(mut self) -> RenderResult<RenderStats> {
        let generator = InstructionGenerator::new(self.edl);
        let total_frames = generator.total_frames();
        tracing::info!(total_frames, "processing frames");

        // Advisory pre-scan: per-frame routing below stays authoritative.
        let encoder_hw = self.encoder.is_using_hardware();
        let all_decoders_hw =
            !self.decoders.is_empty() && self.decoders.values().all(Decoder::is_using_hardware);
        if all_decoders_hw && encoder_hw {
            if generator.iter().any(|i| requires_cpu_processing(&i)) {
                tracing::info!("GPU acceleration on, but some frames need CPU processing");
            } else {
                tracing::info!("GPU passthrough enabled, zero-copy pipeline active");
            }
        }

        let started = Instant::now();
        let mut frames_written: u64 = 0;
        let mut fatal: Option<RenderError> = None;
        let progress_interval = (self.edl.fps / 2).max(1) as u64;

        for instruction in generator.iter() {
            let passthrough = instruction.kind == InstructionKind::DrawFrame
                && encoder_hw
                && self
                    .decoders
                    .get(&instruction.uri)
                    .is_some_and(Decoder::is_using_hardware)
                && !requires_cpu_processing(&instruction);

            if passthrough {
                let decoder = self
                    .decoders
                    .get_mut(&instruction.uri)
                    .expect("checked above");
                match decoder.get_hardware_frame(instruction.source_frame) {
                    Some(hw_frame) => {
                        if let Err(e) = self.encoder.write_hardware_frame(&hw_frame) {
                            tracing::error!(error = %e, "failed to write hardware frame");
                        }
                    }
                    None => {
                        tracing::info!(
                            output_frame = frames_written,
                            source_frame = instruction.source_frame,
                            "source exhausted, stopping"
                        );
                        break;
                    }
                }
            } else {
                let output = match instruction.kind {
                    InstructionKind::DrawFrame => {
                        match self.decoders.get_mut(&instruction.uri) {
                            Some(decoder) => match decoder.get_frame(instruction.source_frame) {
                                Some(input) => {
                                    self.compositor.process(Some(&input), &instruction)?
                                }
                                None => {
                                    tracing::info!(
                                        output_frame = frames_written,
                                        source_frame = instruction.source_frame,
                                        "source exhausted, stopping"
                                    );
                                    break;
                                }
                            },
                            None => {
                                tracing::warn!(uri = %instruction.uri, "no decoder for media");
                                self.compositor.generate_color(0.0, 0.0, 0.0)?
                            }
                        }
                    }
                    InstructionKind::GenerateColor => {
                        let c = instruction.color;
                        self.compositor.generate_color(c.r, c.g, c.b)?
                    }
                    InstructionKind::NoOp | InstructionKind::Transition => {
                        self.compositor.generate_color(0.0, 0.0, 0.0)?
                    }
                };

                if let Err(e) = self.encoder.write_frame(&output) {
                    tracing::error!(error = %e, "encoder failed, aborting after finalize");
                    fatal = Some(e);
                    break;
                }
            }

            frames_written += 1;
            if frames_written % progress_interval == 0 {
                let elapsed = started.elapsed().as_secs_f64();
                tracing::debug!(
                    frame = frames_written,
                    total = total_frames,
                    fps = frames_written as f64 / elapsed.max(1e-9),
                    "progress"
                );
            }
        }

        // Finalize regardless of how the loop ended so the container gets a
        // valid trailer whenever possible.
        let finalize_result = self.encoder.finalize();
        if fatal.is_none() {
            if let Err(e) = finalize_result {
                fatal = Some(e);
            }
        }

        let elapsed = started.elapsed();

        // Decoders go first; they may hold references into the shared device
        // context. The manager's own reference is dropped last, after the
        // GPU has had a moment to settle.
        self.decoders.clear();
        if self.hardware_used {
            std::thread::sleep(Duration::from_millis(100));
        }
        hwaccel::reset_shared_context();

        if let Some(e) = fatal {
            return Err(e);
        }

        let avg_fps = frames_written as f64 / elapsed.as_secs_f64().max(1e-9);
        tracing::info!(
            frames = frames_written,
            seconds = elapsed.as_secs_f64(),
            avg_fps,
            "rendering complete"
        );

        Ok(RenderStats {
            frames_written,
            elapsed,
            avg_fps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Effect, EffectKind};
    use crate::parse::parse_value;
    use serde_json::json;

    fn clean_edl(extra: serde_json::Value) -> crate::model::Edl {
        let mut clip = json!({
            "in": 0.0, "out": 2.0,
            "track": {"type": "video", "number": 1},
            "source": {"uri": "a.mp4", "in": 0.0, "out": 2.0}
        });
        if let (Some(clip_obj), Some(extra_obj)) = (clip.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                clip_obj.insert(k.clone(), v.clone());
            }
        }
        parse_value(&json!({
            "fps": 30, "width": 1920, "height": 1080, "clips": [clip]
        }))
        .unwrap()
    }

    #[test]
    fn clean_draw_frames_stay_on_gpu() {
        let edl = clean_edl(json!({}));
        let generator = InstructionGenerator::new(&edl);
        for instruction in generator.iter() {
            assert!(!requires_cpu_processing(&instruction));
        }
    }

    #[test]
    fn any_fade_forces_cpu_path() {
        let edl = clean_edl(json!({"topFade": 0.5}));
        let generator = InstructionGenerator::new(&edl);
        let first = generator.instruction_at(0);
        assert!(requires_cpu_processing(&first));
    }

    #[test]
    fn effects_force_cpu_path() {
        let edl = clean_edl(json!({"effects": [{"type": "brightness", "strength": 1.2}]}));
        let generator = InstructionGenerator::new(&edl);
        for instruction in generator.iter() {
            assert!(requires_cpu_processing(&instruction));
        }
    }

    #[test]
    fn motion_forces_cpu_path() {
        let edl = clean_edl(json!({"motion": {"panX": 0.25}}));
        let generator = InstructionGenerator::new(&edl);
        assert!(requires_cpu_processing(&generator.instruction_at(0)));
    }

    #[test]
    fn transition_forces_cpu_path() {
        let edl = clean_edl(json!({"transition": {"type": "wipe", "duration": 1.0}}));
        let generator = InstructionGenerator::new(&edl);
        assert!(requires_cpu_processing(&generator.instruction_at(0)));
        // Past the transition window the clip is clean again.
        assert!(!requires_cpu_processing(&generator.instruction_at(45)));
    }

    #[test]
    fn non_draw_instructions_force_cpu_path() {
        let edl = clean_edl(json!({}));
        let generator = InstructionGenerator::new(&edl);
        // Past the clip the generator emits black fills.
        let beyond = generator.instruction_at(59);
        assert_eq!(beyond.kind, InstructionKind::DrawFrame);

        let mut synthetic = generator.instruction_at(0);
        synthetic.kind = InstructionKind::GenerateColor;
        assert!(requires_cpu_processing(&synthetic));
    }

    #[test]
    fn tiny_motion_below_epsilon_is_ignored() {
        let edl = clean_edl(json!({"motion": {"panX": 0.0005, "zoomX": 1.0005}}));
        let generator = InstructionGenerator::new(&edl);
        assert!(!requires_cpu_processing(&generator.instruction_at(0)));
    }

    #[test]
    fn flip_forces_cpu_path() {
        let mut instruction = {
            let edl = clean_edl(json!({}));
            let generator = InstructionGenerator::new(&edl);
            generator.instruction_at(0)
        };
        instruction.geometry.flip = true;
        assert!(requires_cpu_processing(&instruction));
    }

    #[test]
    fn saturation_effect_also_forces_cpu() {
        let mut instruction = {
            let edl = clean_edl(json!({}));
            let generator = InstructionGenerator::new(&edl);
            generator.instruction_at(0)
        };
        instruction
            .effects
            .push(Effect::simple(EffectKind::Saturation, 1.3));
        assert!(requires_cpu_processing(&instruction));
    }

    #[test]
    fn uri_resolution_prefers_existing_paths() {
        let dir = std::env::temp_dir();
        let resolved = resolve_media_uri("does-not-exist-anywhere.mp4", Some(dir.as_path()));
        assert_eq!(resolved, PathBuf::from("does-not-exist-anywhere.mp4"));
    }
}
