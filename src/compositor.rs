//! CPU frame composition: color generation, fades, and LUT-driven effects.
//!
//! Pixel effects operate on the planar-YUV families only; other formats pass
//! through untouched. Per-pixel transfer functions are collapsed into a
//! 256-entry lookup table built once per effect application, so the inner
//! loop is a byte load regardless of how the function was specified.

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::util::frame::video::Video;

use crate::error::RenderResult;
use crate::frame_pool::{FramePool, PooledFrame};
use crate::instruction::{Effect, EffectKind, Instruction, InstructionKind};
use crate::model::MappingPair;

const TRANSFORM_EPSILON: f32 = 1e-3;

pub struct Compositor {
    width: u32,
    height: u32,
    format: Pixel,
    pool: FramePool,
    scaler: Option<CachedScaler>,
}

struct CachedScaler {
    context: scaling::Context,
    src_format: Pixel,
    src_width: u32,
    src_height: u32,
}

impl Compositor {
    pub fn new(width: u32, height: u32, format: Pixel) -> Self {
        tracing::info!(width, height, format = ?format, "frame compositor initialized");
        Compositor {
            width,
            height,
            format,
            pool: FramePool::new(width, height, format, 8),
            scaler: None,
        }
    }

    /// Produces the output frame for one instruction. A missing input frame
    /// degrades to black rather than failing the run.
    pub fn process(
        &mut self,
        input: Option<&Video>,
        instruction: &Instruction,
    ) -> RenderResult<PooledFrame> {
        let Some(input) = input else {
            return self.generate_color(0.0, 0.0, 0.0);
        };

        let mut output = self.pool.acquire()?;

        if input.width() != self.width
            || input.height() != self.height
            || input.format() != self.format
        {
            let scaler = self.scaler_for(input)?;
            scaler.run(input, &mut output)?;
        } else {
            unsafe {
                ffmpeg::ffi::av_frame_copy(output.as_mut_ptr(), input.as_ptr());
                ffmpeg::ffi::av_frame_copy_props(output.as_mut_ptr(), input.as_ptr());
            }
        }

        if instruction.kind == InstructionKind::DrawFrame {
            if instruction.fade < 1.0 {
                self.apply_fade(&mut output, instruction.fade);
            }

            for effect in &instruction.effects {
                self.apply_effect(&mut output, effect);
            }

            let g = &instruction.geometry;
            if g.pan_x.abs() > TRANSFORM_EPSILON
                || g.pan_y.abs() > TRANSFORM_EPSILON
                || (g.zoom_x - 1.0).abs() > TRANSFORM_EPSILON
                || (g.zoom_y - 1.0).abs() > TRANSFORM_EPSILON
                || g.rotation.abs() > TRANSFORM_EPSILON
            {
                tracing::debug!("geometric transform requested but not implemented");
            }
        }

        Ok(output)
    }

    /// A frame filled with a solid color, `r`/`g`/`b` in `[0, 1]`.
    pub fn generate_color(&mut self, r: f32, g: f32, b: f32) -> RenderResult<PooledFrame> {
        let mut frame = self.pool.acquire()?;
        fill_with_color(&mut frame, self.format, self.width, self.height, r, g, b);
        Ok(frame)
    }

    fn scaler_for(&mut self, input: &Video) -> RenderResult<&mut scaling::Context> {
        let stale = match &self.scaler {
            Some(cached) => {
                cached.src_format != input.format()
                    || cached.src_width != input.width()
                    || cached.src_height != input.height()
            }
            None => true,
        };
        if stale {
            self.scaler = Some(CachedScaler {
                context: scaling::Context::get(
                    input.format(),
                    input.width(),
                    input.height(),
                    self.format,
                    self.width,
                    self.height,
                    scaling::Flags::BILINEAR,
                )?,
                src_format: input.format(),
                src_width: input.width(),
                src_height: input.height(),
            });
        }
        Ok(&mut self.scaler.as_mut().expect("created above").context)
    }

    /// Luma scales toward zero; chroma scales about the neutral 128 so the
    /// image fades to true black rather than green.
    fn apply_fade(&self, frame: &mut Video, fade: f32) {
        if fade >= 1.0 {
            return;
        }

        if is_planar_yuv(self.format) {
            let width = self.width as usize;
            let height = self.height as usize;
            scale_plane(frame, 0, width, height, |v| {
                (f32::from(v) * fade).clamp(0.0, 255.0) as u8
            });

            let (cw, ch) = chroma_dims(self.format, width, height);
            for plane in 1..=2 {
                scale_plane(frame, plane, cw, ch, |v| {
                    let centered = 128.0 + (f32::from(v) - 128.0) * fade;
                    centered.clamp(0.0, 255.0) as u8
                });
            }
        } else if matches!(self.format, Pixel::RGB24 | Pixel::BGR24) {
            let width = self.width as usize * 3;
            scale_plane(frame, 0, width, self.height as usize, |v| {
                (f32::from(v) * fade).clamp(0.0, 255.0) as u8
            });
        }
    }

    fn apply_effect(&self, frame: &mut Video, effect: &Effect) {
        if !is_planar_yuv(self.format) {
            return;
        }

        let width = self.width as usize;
        let height = self.height as usize;

        match effect.kind {
            EffectKind::Brightness => {
                let lut = match &effect.linear_mapping {
                    Some(mapping) => build_transfer_lut(mapping),
                    None => build_brightness_lut(effect.strength),
                };
                apply_lut_to_luma(frame, &lut, width, height);
            }
            EffectKind::Contrast => {
                let lut = build_contrast_lut(effect.strength);
                apply_lut_to_luma(frame, &lut, width, height);
            }
            EffectKind::Saturation | EffectKind::Blur | EffectKind::Sharpen => {
                tracing::debug!(kind = ?effect.kind, "effect not implemented");
            }
        }
    }
}

fn is_planar_yuv(format: Pixel) -> bool {
    matches!(format, Pixel::YUV420P | Pixel::YUV422P | Pixel::YUV444P)
}

fn chroma_dims(format: Pixel, width: usize, height: usize) -> (usize, usize) {
    match format {
        Pixel::YUV420P => (width / 2, height / 2),
        Pixel::YUV422P => (width / 2, height),
        _ => (width, height),
    }
}

fn scale_plane(frame: &mut Video, plane: usize, width: usize, height: usize, f: impl Fn(u8) -> u8) {
    let stride = frame.stride(plane);
    let data = frame.data_mut(plane);
    for row in 0..height {
        let line = &mut data[row * stride..row * stride + width];
        for value in line {
            *value = f(*value);
        }
    }
}

fn fill_with_color(frame: &mut Video, format: Pixel, width: u32, height: u32, r: f32, g: f32, b: f32) {
    let width = width as usize;
    let height = height as usize;

    if is_planar_yuv(format) {
        let y = (0.299 * r * 255.0 + 0.587 * g * 255.0 + 0.114 * b * 255.0).clamp(0.0, 255.0) as u8;
        let u =
            (-0.147 * r * 255.0 - 0.289 * g * 255.0 + 0.436 * b * 255.0 + 128.0).clamp(0.0, 255.0)
                as u8;
        let v =
            (0.615 * r * 255.0 - 0.515 * g * 255.0 - 0.100 * b * 255.0 + 128.0).clamp(0.0, 255.0)
                as u8;

        fill_plane(frame, 0, width, height, y);
        let (cw, ch) = chroma_dims(format, width, height);
        fill_plane(frame, 1, cw, ch, u);
        fill_plane(frame, 2, cw, ch, v);
    } else if matches!(format, Pixel::RGB24 | Pixel::BGR24) {
        let pixel = if format == Pixel::RGB24 {
            [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8]
        } else {
            [(b * 255.0) as u8, (g * 255.0) as u8, (r * 255.0) as u8]
        };
        let stride = frame.stride(0);
        let data = frame.data_mut(0);
        for row in 0..height {
            let line = &mut data[row * stride..row * stride + width * 3];
            for px in line.chunks_exact_mut(3) {
                px.copy_from_slice(&pixel);
            }
        }
    }
}

fn fill_plane(frame: &mut Video, plane: usize, width: usize, height: usize, value: u8) {
    let stride = frame.stride(plane);
    let data = frame.data_mut(plane);
    for row in 0..height {
        data[row * stride..row * stride + width].fill(value);
    }
}

fn build_brightness_lut(strength: f32) -> [u8; 256] {
    let adjustment = ((strength - 1.0) * 255.0) as i32;
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        *entry = (i as i32 + adjustment).clamp(0, 255) as u8;
    }
    lut
}

fn build_contrast_lut(strength: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let value = 128.0 + (i as f32 - 128.0) * strength;
        *entry = value.clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Collapses a piecewise-linear `(src, dst)` transfer function into a byte
/// LUT. Inputs outside the sampled range clamp to the nearest endpoint;
/// degenerate spans fall back to the left sample.
fn build_transfer_lut(mapping: &[MappingPair]) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let x = i as f32 / 255.0;
        let y = eval_piecewise(mapping, x);
        *entry = (y * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

fn eval_piecewise(mapping: &[MappingPair], x: f32) -> f32 {
    let (Some(first), Some(last)) = (mapping.first(), mapping.last()) else {
        return x;
    };
    if x < first.src {
        return first.dst;
    }
    if x > last.src {
        return last.dst;
    }

    for window in mapping.windows(2) {
        let (prev, next) = (window[0], window[1]);
        if x >= prev.src && x <= next.src {
            if next.src - prev.src < 1e-4 {
                return prev.dst;
            }
            let t = (x - prev.src) / (next.src - prev.src);
            return prev.dst + (next.dst - prev.dst) * t;
        }
    }

    last.dst
}

/// Byte-LUT pass over the luma plane, eight pixels per inner step.
fn apply_lut_to_luma(frame: &mut Video, lut: &[u8; 256], width: usize, height: usize) {
    let stride = frame.stride(0);
    let data = frame.data_mut(0);
    for row in 0..height {
        let line = &mut data[row * stride..row * stride + width];
        let mut chunks = line.chunks_exact_mut(8);
        for chunk in &mut chunks {
            for px in chunk.iter_mut() {
                *px = lut[usize::from(*px)];
            }
        }
        for px in chunks.into_remainder() {
            *px = lut[usize::from(*px)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Geometry, Rgb, TransitionInfo};
    use smallvec::smallvec;

    const W: u32 = 64;
    const H: u32 = 48;

    fn compositor() -> Compositor {
        Compositor::new(W, H, Pixel::YUV420P)
    }

    fn draw_instruction(fade: f32, effects: smallvec::SmallVec<[Effect; 4]>) -> Instruction {
        Instruction {
            kind: InstructionKind::DrawFrame,
            track_number: 1,
            uri: "a.mp4".to_string(),
            source_frame: 0,
            geometry: Geometry::default(),
            fade,
            effects,
            transition: TransitionInfo::default(),
            color: Rgb::default(),
        }
    }

    fn yuv_input(y: u8, u: u8, v: u8) -> Video {
        let mut frame = Video::new(Pixel::YUV420P, W, H);
        fill_plane(&mut frame, 0, W as usize, H as usize, y);
        let (cw, ch) = chroma_dims(Pixel::YUV420P, W as usize, H as usize);
        fill_plane(&mut frame, 1, cw, ch, u);
        fill_plane(&mut frame, 2, cw, ch, v);
        frame
    }

    fn luma_at(frame: &Video, x: usize, y: usize) -> u8 {
        frame.data(0)[y * frame.stride(0) + x]
    }

    fn chroma_at(frame: &Video, plane: usize, x: usize, y: usize) -> u8 {
        frame.data(plane)[y * frame.stride(plane) + x]
    }

    #[test]
    fn black_fill_is_zero_luma_neutral_chroma() {
        let mut compositor = compositor();
        let frame = compositor.generate_color(0.0, 0.0, 0.0).unwrap();
        assert_eq!(luma_at(&frame, 0, 0), 0);
        assert_eq!(chroma_at(&frame, 1, 0, 0), 128);
        assert_eq!(chroma_at(&frame, 2, 0, 0), 128);
    }

    #[test]
    fn white_fill_saturates_luma_with_neutral_chroma() {
        let mut compositor = compositor();
        let frame = compositor.generate_color(1.0, 1.0, 1.0).unwrap();
        assert!(luma_at(&frame, 10, 10) >= 254);
        // BT.601 weights for chroma cancel out on white.
        assert_eq!(chroma_at(&frame, 1, 5, 5), 128);
        assert_eq!(chroma_at(&frame, 2, 5, 5), 128);
    }

    #[test]
    fn null_input_produces_black() {
        let mut compositor = compositor();
        let instruction = draw_instruction(1.0, smallvec![]);
        let frame = compositor.process(None, &instruction).unwrap();
        assert_eq!(luma_at(&frame, 0, 0), 0);
        assert_eq!(chroma_at(&frame, 1, 0, 0), 128);
    }

    #[test]
    fn fade_scales_luma_and_centers_chroma() {
        let mut compositor = compositor();
        let input = yuv_input(100, 200, 60);
        let instruction = draw_instruction(0.5, smallvec![]);
        let frame = compositor.process(Some(&input), &instruction).unwrap();

        assert_eq!(luma_at(&frame, 3, 3), 50);
        // U: 128 + (200-128)*0.5 = 164; V: 128 + (60-128)*0.5 = 94.
        assert_eq!(chroma_at(&frame, 1, 2, 2), 164);
        assert_eq!(chroma_at(&frame, 2, 2, 2), 94);
    }

    #[test]
    fn full_fade_is_untouched_copy() {
        let mut compositor = compositor();
        let input = yuv_input(137, 90, 201);
        let instruction = draw_instruction(1.0, smallvec![]);
        let frame = compositor.process(Some(&input), &instruction).unwrap();
        assert_eq!(luma_at(&frame, 7, 7), 137);
        assert_eq!(chroma_at(&frame, 1, 3, 3), 90);
        assert_eq!(chroma_at(&frame, 2, 3, 3), 201);
    }

    #[test]
    fn brightness_shifts_luma_only() {
        let mut compositor = compositor();
        let input = yuv_input(100, 90, 110);
        let effect = Effect::simple(EffectKind::Brightness, 1.2);
        let instruction = draw_instruction(1.0, smallvec![effect]);
        let frame = compositor.process(Some(&input), &instruction).unwrap();

        // (1.2 - 1.0) * 255 truncates to 51.
        assert_eq!(luma_at(&frame, 0, 0), 151);
        assert_eq!(chroma_at(&frame, 1, 0, 0), 90);
        assert_eq!(chroma_at(&frame, 2, 0, 0), 110);
    }

    #[test]
    fn brightness_unit_strength_is_identity() {
        let lut = build_brightness_lut(1.0);
        for i in 0..256 {
            assert_eq!(lut[i], i as u8);
        }
    }

    #[test]
    fn identity_mapping_lut_matches_identity() {
        let mapping = [
            MappingPair { src: 0.0, dst: 0.0 },
            MappingPair { src: 1.0, dst: 1.0 },
        ];
        let lut = build_transfer_lut(&mapping);
        for i in 0..256 {
            let diff = (i32::from(lut[i as usize]) - i as i32).abs();
            assert!(diff <= 1, "lut[{i}] = {} drifted", lut[i as usize]);
        }
    }

    #[test]
    fn transfer_lut_clamps_outside_sampled_range() {
        let mapping = [
            MappingPair { src: 0.25, dst: 0.5 },
            MappingPair { src: 0.75, dst: 1.0 },
        ];
        let lut = build_transfer_lut(&mapping);
        // Below the first sample everything is first.dst.
        assert_eq!(lut[0], 128);
        // Above the last sample everything is last.dst.
        assert_eq!(lut[255], 255);
    }

    #[test]
    fn degenerate_span_uses_left_sample() {
        let mapping = [
            MappingPair { src: 0.5, dst: 0.2 },
            MappingPair {
                src: 0.500_05,
                dst: 0.9,
            },
        ];
        assert!((eval_piecewise(&mapping, 0.5) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn contrast_expands_about_midpoint() {
        let lut = build_contrast_lut(2.0);
        assert_eq!(lut[128], 128);
        assert_eq!(lut[100], 72);
        assert_eq!(lut[156], 184);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
    }

    #[test]
    fn effects_skip_non_yuv_formats() {
        let mut compositor = Compositor::new(W, H, Pixel::RGB24);
        let mut input = Video::new(Pixel::RGB24, W, H);
        let stride = input.stride(0);
        input.data_mut(0)[..stride].fill(77);

        let effect = Effect::simple(EffectKind::Brightness, 1.9);
        let instruction = draw_instruction(1.0, smallvec![effect]);
        let frame = compositor.process(Some(&input), &instruction).unwrap();
        assert_eq!(frame.data(0)[0], 77);
    }

    #[test]
    fn generate_color_packed_rgb_orders_channels() {
        let mut rgb = Compositor::new(16, 16, Pixel::RGB24);
        let frame = rgb.generate_color(1.0, 0.0, 0.0).unwrap();
        assert_eq!(&frame.data(0)[0..3], &[255, 0, 0]);

        let mut bgr = Compositor::new(16, 16, Pixel::BGR24);
        let frame = bgr.generate_color(1.0, 0.0, 0.0).unwrap();
        assert_eq!(&frame.data(0)[0..3], &[0, 0, 255]);
    }

    #[test]
    fn mismatched_input_is_scaled_to_output_geometry() {
        let mut compositor = compositor();
        let mut input = Video::new(Pixel::YUV420P, W * 2, H * 2);
        fill_plane(&mut input, 0, (W * 2) as usize, (H * 2) as usize, 90);
        let (cw, ch) = chroma_dims(Pixel::YUV420P, (W * 2) as usize, (H * 2) as usize);
        fill_plane(&mut input, 1, cw, ch, 128);
        fill_plane(&mut input, 2, cw, ch, 128);

        let instruction = draw_instruction(1.0, smallvec![]);
        let frame = compositor.process(Some(&input), &instruction).unwrap();
        assert_eq!(frame.width(), W);
        assert_eq!(frame.height(), H);
        assert_eq!(luma_at(&frame, 5, 5), 90);
    }
}
