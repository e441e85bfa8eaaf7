//! Per-source decoding: demux, seek-by-frame, decode-next, hardware path.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::{self, Pixel};
use ffmpeg::media;
use ffmpeg::software::scaling;
use ffmpeg::util::frame::video::Video;
use ffmpeg::Rational;

use crate::error::{RenderError, RenderResult};
use crate::frame_pool::{FramePool, PooledFrame};
use crate::hwaccel::{self, HwAccel, HwConfig, HwDeviceContext};

/// Forward jumps shorter than this are decoded linearly; a byte-level seek
/// plus keyframe re-decode costs more than walking a few dozen frames.
const SEEK_AHEAD_THRESHOLD: i64 = 60;

#[derive(Clone, Debug, Default)]
pub struct DecoderConfig {
    pub use_hardware: bool,
    pub hw: HwConfig,
    /// 0 lets libav pick a thread count for the host.
    pub thread_count: i32,
}

pub struct Decoder {
    input: format::context::Input,
    decoder: codec::decoder::Video,
    packet: ffmpeg::Packet,
    scaler: Option<CachedScaler>,
    hw_context: Option<HwDeviceContext>,
    using_hardware: bool,
    stream_index: usize,
    time_base: Rational,
    frame_rate: Rational,
    total_frames: i64,
    /// Frame number of the most recently decoded frame, -1 before any.
    current_frame: i64,
    eof_sent: bool,
    pool: FramePool,
}

struct CachedScaler {
    context: scaling::Context,
    src_format: Pixel,
    src_width: u32,
    src_height: u32,
}

impl Decoder {
    pub fn open(
        path: impl AsRef<Path>,
        config: &DecoderConfig,
        shared_context: Option<&HwDeviceContext>,
    ) -> RenderResult<Self> {
        ffmpeg::init().map_err(RenderError::from)?;

        let path = path.as_ref();
        let input = format::input(path)
            .map_err(|e| RenderError::io_open(path.display().to_string(), e))?;

        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| {
                RenderError::io_open(path.display().to_string(), "no video stream found")
            })?;

        let stream_index = stream.index();
        let time_base = stream.time_base();
        let frame_rate = stream.avg_frame_rate();
        let parameters = stream.parameters();
        let codec_id = parameters.id();

        let total_frames = if stream.frames() > 0 {
            stream.frames()
        } else if stream.duration() > 0 {
            unsafe {
                ffmpeg::ffi::av_rescale_q(
                    stream.duration(),
                    time_base.into(),
                    frame_rate.invert().into(),
                )
            }
        } else if input.duration() > 0 {
            input.duration() * i64::from(frame_rate.numerator())
                / (i64::from(frame_rate.denominator()) * i64::from(ffmpeg::ffi::AV_TIME_BASE))
        } else {
            0
        };

        // Resolve a hardware decoder when asked: NVIDIA exposes dedicated
        // CUVID decoders; VAAPI and VideoToolbox ride the standard decoder
        // with a device context attached.
        let mut using_hardware = false;
        let mut hw_context = None;
        let mut hw_codec = None;

        if config.use_hardware {
            let accel = config.hw.accel.resolve();
            if accel != HwAccel::None {
                let candidate = match accel.decoder_name(codec_id) {
                    Some(name) => codec::decoder::find_by_name(name).map(|c| (c, name.to_string())),
                    None => codec::decoder::find(codec_id).map(|c| (c, format!("{codec_id:?}"))),
                };

                if let Some((codec, name)) = candidate {
                    let context = match shared_context {
                        Some(shared) if shared.accel() == accel => Ok(shared.clone()),
                        _ => HwDeviceContext::create(accel, config.hw.device_index),
                    };
                    match context {
                        Ok(context) => {
                            tracing::info!(decoder = %name, "using hardware decoder");
                            hw_context = Some(context);
                            hw_codec = Some(codec);
                            using_hardware = true;
                        }
                        Err(e) if config.hw.allow_fallback => {
                            tracing::warn!(error = %e, "hardware decode unavailable, using software");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let mut context = codec::context::Context::from_parameters(parameters)?;

        unsafe {
            let raw = context.as_mut_ptr();
            // Frame plus slice threading; 0 threads = auto-scale to the host.
            (*raw).thread_count = config.thread_count;
            (*raw).thread_type =
                (ffmpeg::ffi::FF_THREAD_FRAME | ffmpeg::ffi::FF_THREAD_SLICE) as i32;
            if let Some(hw) = &hw_context {
                (*raw).hw_device_ctx = hw.new_ref()?;
            }
        }

        let decoder = match hw_codec {
            Some(codec) => context.decoder().open_as(codec)?.video()?,
            None => context.decoder().video()?,
        };

        let width = decoder.width();
        let height = decoder.height();
        let pixel_format = decoder.format();

        // Hardware decoders report an opaque device format; the pool holds the
        // system-memory frames transfers land in.
        let pool_format = if using_hardware && hwaccel::is_hardware_format(pixel_format) {
            Pixel::YUV420P
        } else {
            pixel_format
        };
        let pool = FramePool::new(width, height, pool_format, 8);

        tracing::info!(
            path = %path.display(),
            width,
            height,
            fps = f64::from(frame_rate),
            total_frames,
            hardware = using_hardware,
            "decoder initialized"
        );

        Ok(Decoder {
            input,
            decoder,
            packet: ffmpeg::Packet::empty(),
            scaler: None,
            hw_context,
            using_hardware,
            stream_index,
            time_base,
            frame_rate,
            total_frames,
            current_frame: -1,
            eof_sent: false,
            pool,
        })
    }

    pub fn is_using_hardware(&self) -> bool {
        self.using_hardware
    }

    pub fn total_frames(&self) -> i64 {
        self.total_frames
    }

    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    /// Positions the decoder so the next decoded frame is `frame_number`.
    pub fn seek_to_frame(&mut self, frame_number: i64) -> bool {
        if frame_number < 0 || (self.total_frames > 0 && frame_number >= self.total_frames) {
            return false;
        }

        if self.current_frame == frame_number {
            return true;
        }

        if self.current_frame > frame_number
            || self.current_frame < frame_number - SEEK_AHEAD_THRESHOLD
        {
            let target_pts = self.frame_to_pts(frame_number);
            let ret = unsafe {
                ffmpeg::ffi::av_seek_frame(
                    self.input.as_mut_ptr(),
                    self.stream_index as i32,
                    target_pts,
                    ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as i32,
                )
            };
            if ret < 0 {
                tracing::error!(frame_number, "seek failed");
                return false;
            }

            self.decoder.flush();
            self.packet = ffmpeg::Packet::empty();
            self.eof_sent = false;
            self.current_frame = -1;
        }

        // Walk forward, discarding frames, until the target is next.
        let mut scratch = Video::empty();
        while self.current_frame < frame_number - 1 {
            if !self.decode_next(&mut scratch) {
                return false;
            }
        }

        true
    }

    /// Decodes frame `frame_number` into a pooled system-memory frame.
    /// `None` means the source has nothing left to give.
    pub fn get_frame(&mut self, frame_number: i64) -> Option<PooledFrame> {
        if !self.seek_to_frame(frame_number) {
            return None;
        }

        if self.using_hardware {
            let mut decoded = Video::empty();
            if !self.decode_next(&mut decoded) {
                return None;
            }
            return self.transfer_to_pool(&decoded);
        }

        let mut frame = self.pool.acquire().ok()?;
        if !self.decode_next(&mut frame) {
            return None;
        }
        Some(frame)
    }

    /// Decodes frame `frame_number` and returns it still resident on the GPU.
    pub fn get_hardware_frame(&mut self, frame_number: i64) -> Option<Video> {
        if !self.using_hardware {
            tracing::warn!("get_hardware_frame called without hardware decoding");
            return None;
        }

        if !self.seek_to_frame(frame_number) {
            return None;
        }

        let mut frame = Video::empty();
        if !self.decode_next(&mut frame) {
            return None;
        }
        Some(frame)
    }

    /// Pulls packets and yields the next decoded frame for our stream.
    /// Flushes the codec with EOF at container end.
    fn decode_next(&mut self, frame: &mut Video) -> bool {
        loop {
            if self.decoder.receive_frame(frame).is_ok() {
                self.current_frame += 1;
                return true;
            }

            if self.eof_sent {
                return false;
            }

            match self.packet.read(&mut self.input) {
                Ok(()) => {
                    if self.packet.stream() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&self.packet) {
                        tracing::debug!(error = %e, "decoder rejected packet");
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    let _ = self.decoder.send_eof();
                    self.eof_sent = true;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed reading packet");
                    return false;
                }
            }
        }
    }

    /// GPU frame → system memory, converting into the pool's format when the
    /// transfer lands in something else (VideoToolbox likes NV12/P010).
    fn transfer_to_pool(&mut self, hw_frame: &Video) -> Option<PooledFrame> {
        if !hwaccel::is_hardware_frame(hw_frame) {
            // Some decoders hand back software frames even in hardware mode.
            let mut pooled = self.pool.acquire().ok()?;
            if copy_frame(&mut pooled, hw_frame).is_err() {
                return None;
            }
            return Some(pooled);
        }

        let sw_format = unsafe {
            let raw = hw_frame.as_ptr();
            if (*raw).hw_frames_ctx.is_null() {
                Pixel::NV12
            } else {
                let frames_ctx =
                    (*(*raw).hw_frames_ctx).data as *const ffmpeg::ffi::AVHWFramesContext;
                Pixel::from((*frames_ctx).sw_format)
            }
        };

        let mut transferred = Video::new(sw_format, hw_frame.width(), hw_frame.height());
        let ret = unsafe {
            ffmpeg::ffi::av_hwframe_transfer_data(transferred.as_mut_ptr(), hw_frame.as_ptr(), 0)
        };
        if ret < 0 {
            tracing::error!(
                error = %ffmpeg::Error::from(ret),
                "hardware frame transfer failed"
            );
            return None;
        }

        let mut pooled = self.pool.acquire().ok()?;
        if transferred.format() == pooled.format()
            && transferred.width() == pooled.width()
            && transferred.height() == pooled.height()
        {
            if copy_frame(&mut pooled, &transferred).is_err() {
                return None;
            }
        } else {
            let scaler = self.scaler_for(&transferred, pooled.format())?;
            if let Err(e) = scaler.run(&transferred, &mut pooled) {
                tracing::error!(error = %e, "transfer format conversion failed");
                return None;
            }
        }
        Some(pooled)
    }

    fn scaler_for(&mut self, src: &Video, dst_format: Pixel) -> Option<&mut scaling::Context> {
        let stale = match &self.scaler {
            Some(cached) => {
                cached.src_format != src.format()
                    || cached.src_width != src.width()
                    || cached.src_height != src.height()
            }
            None => true,
        };

        if stale {
            let context = scaling::Context::get(
                src.format(),
                src.width(),
                src.height(),
                dst_format,
                self.pool.width(),
                self.pool.height(),
                scaling::Flags::BILINEAR,
            )
            .map_err(|e| tracing::error!(error = %e, "failed to create scaler"))
            .ok()?;
            self.scaler = Some(CachedScaler {
                context,
                src_format: src.format(),
                src_width: src.width(),
                src_height: src.height(),
            });
        }

        self.scaler.as_mut().map(|c| &mut c.context)
    }

    fn frame_to_pts(&self, frame_number: i64) -> i64 {
        unsafe {
            ffmpeg::ffi::av_rescale_q(
                frame_number,
                self.frame_rate.invert().into(),
                self.time_base.into(),
            )
        }
    }
}

fn copy_frame(dst: &mut Video, src: &Video) -> RenderResult<()> {
    unsafe {
        let ret = ffmpeg::ffi::av_frame_copy(dst.as_mut_ptr(), src.as_ptr());
        if ret < 0 {
            return Err(RenderError::from(ffmpeg::Error::from(ret)));
        }
        let ret = ffmpeg::ffi::av_frame_copy_props(dst.as_mut_ptr(), src.as_ptr());
        if ret < 0 {
            return Err(RenderError::from(ffmpeg::Error::from(ret)));
        }
    }
    Ok(())
}
