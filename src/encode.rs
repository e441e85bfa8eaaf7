//! Output encoding: codec resolution, hardware frame contexts, asynchronous
//! packet draining, and ordered teardown for GPU backends.

use std::path::Path;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::{self, Pixel};
use ffmpeg::software::scaling;
use ffmpeg::util::frame::video::Video;
use ffmpeg::{Dictionary, Rational};

use crate::error::{RenderError, RenderResult};
use crate::hwaccel::{self, HwAccel, HwConfig, HwDeviceContext};

/// In-flight ceiling for asynchronous hardware encoding. Packets are drained
/// opportunistically once the queue is within two frames of this.
const ASYNC_QUEUE_SIZE: usize = 16;

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: i32,
    /// Bits per second; 0 together with `crf` selects constant-quality mode.
    pub bitrate: usize,
    pub preset: String,
    pub crf: Option<i32>,
    pub pixel_format: Pixel,
    pub use_hardware: bool,
    pub hw: HwConfig,
    /// GPU passthrough: decoded hardware frames arrive without a CPU copy.
    pub expect_hardware_frames: bool,
    pub thread_count: i32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            codec: "libx264".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: 446_464,
            preset: "faster".to_string(),
            crf: None,
            pixel_format: Pixel::YUV420P,
            use_hardware: false,
            hw: HwConfig::default(),
            expect_hardware_frames: false,
            thread_count: 0,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> RenderResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::invalid_edl("encode width/height must be non-zero"));
        }
        if self.fps <= 0 {
            return Err(RenderError::invalid_edl("encode fps must be positive"));
        }
        if self.codec.trim().is_empty() {
            return Err(RenderError::codec_unavailable("codec name must be non-empty"));
        }
        Ok(())
    }

    fn crf_mode(&self) -> bool {
        self.crf.is_some() && self.bitrate == 0
    }
}

pub struct Encoder {
    // Field order is teardown order: codec context first, scratch frames,
    // then the device context, and the muxer/IO last.
    encoder: codec::encoder::video::Encoder,
    converted: Option<Video>,
    hw_upload: Option<Video>,
    scaler: Option<CachedScaler>,
    hw_context: Option<HwDeviceContext>,
    octx: format::context::Output,
    config: EncoderConfig,
    codec_name: String,
    stream_index: usize,
    stream_time_base: Rational,
    codec_time_base: Rational,
    using_hardware: bool,
    async_mode: bool,
    frames_in_flight: usize,
    pts: i64,
    frames_written: u64,
    finalized: bool,
    color_props_set: bool,
}

struct CachedScaler {
    context: scaling::Context,
    src_format: Pixel,
    src_width: u32,
    src_height: u32,
}

impl Encoder {
    pub fn open(
        path: impl AsRef<Path>,
        config: EncoderConfig,
        shared_context: Option<&HwDeviceContext>,
    ) -> RenderResult<Self> {
        config.validate()?;
        ffmpeg::init().map_err(RenderError::from)?;

        let path = path.as_ref();
        let mut octx = format::output(path)
            .map_err(|e| RenderError::io_open(path.display().to_string(), e))?;

        let codec_id = match config.codec.as_str() {
            "libx264" | "h264" => Some(codec::Id::H264),
            "libx265" | "hevc" => Some(codec::Id::HEVC),
            _ => None,
        };

        // Hardware encoder resolution: codec id x accel type, with fallback
        // to the requested software encoder.
        let mut using_hardware = false;
        let mut hw_context: Option<HwDeviceContext> = None;
        let mut codec_handle = None;
        let mut codec_name = config.codec.clone();

        if config.use_hardware {
            if let Some(id) = codec_id {
                let accel = config.hw.accel.resolve();
                if let Some(name) = accel.encoder_name(id) {
                    if let Some(found) = ffmpeg::encoder::find_by_name(name) {
                        // VideoToolbox encodes without an explicit device
                        // context; everything else needs one.
                        let context = if accel == HwAccel::VideoToolbox {
                            Ok(None)
                        } else {
                            match shared_context {
                                Some(shared) if shared.accel() == accel => {
                                    tracing::info!("encoder sharing hardware device context");
                                    Ok(Some(shared.clone()))
                                }
                                _ => HwDeviceContext::create(accel, config.hw.device_index)
                                    .map(Some),
                            }
                        };
                        match context {
                            Ok(context) => {
                                tracing::info!(encoder = name, "using hardware encoder");
                                hw_context = context;
                                codec_handle = Some(found);
                                codec_name = name.to_string();
                                using_hardware = true;
                            }
                            Err(e) if config.hw.allow_fallback => {
                                tracing::warn!(
                                    error = %e,
                                    "hardware encode unavailable, using software"
                                );
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        if codec_handle.is_none() {
            codec_handle = ffmpeg::encoder::find_by_name(&config.codec)
                .or_else(|| codec_id.and_then(ffmpeg::encoder::find));
            codec_name = config.codec.clone();

            // The user may name a hardware encoder directly.
            if codec_handle.is_some() && name_is_hardware(&codec_name) {
                using_hardware = true;
                let accel = accel_from_name(&codec_name);
                if accel != HwAccel::None && accel != HwAccel::VideoToolbox {
                    hw_context = match shared_context {
                        Some(shared) if shared.accel() == accel => Some(shared.clone()),
                        _ => match HwDeviceContext::create(accel, config.hw.device_index) {
                            Ok(ctx) => Some(ctx),
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    encoder = %codec_name,
                                    "no device context, encoder may still work"
                                );
                                None
                            }
                        },
                    };
                }
            }
        }

        let codec_handle = codec_handle.ok_or_else(|| {
            RenderError::codec_unavailable(format!("encoder not found: {}", config.codec))
        })?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let codec_time_base = Rational::new(1, config.fps);
        let mut encoder = codec::context::Context::new_with_codec(codec_handle)
            .encoder()
            .video()?;

        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_time_base(codec_time_base);
        encoder.set_frame_rate(Some(Rational::new(config.fps, 1)));
        encoder.set_bit_rate(if config.crf_mode() { 0 } else { config.bitrate });
        encoder.set_gop(300);

        let accel = config.hw.accel.resolve();
        let passthrough_capable = using_hardware
            && config.expect_hardware_frames
            && accel != HwAccel::VideoToolbox
            && hw_context.is_some();

        if passthrough_capable {
            let hw_format = accel
                .pixel_format()
                .ok_or_else(|| RenderError::hardware_init("accel has no pixel format"))?;
            let device = hw_context.as_ref().expect("checked above");

            unsafe {
                let raw = encoder.as_mut_ptr();
                (*raw).hw_device_ctx = device.new_ref()?;

                // A frames context lets decoded GPU surfaces flow straight
                // into the encoder without touching system memory.
                let frames_ref = ffmpeg::ffi::av_hwframe_ctx_alloc(device.as_ptr());
                if frames_ref.is_null() {
                    return Err(RenderError::hardware_init(
                        "av_hwframe_ctx_alloc failed".to_string(),
                    ));
                }
                let frames_ctx = (*frames_ref).data as *mut ffmpeg::ffi::AVHWFramesContext;
                (*frames_ctx).format = hw_format.into();
                (*frames_ctx).sw_format = config.pixel_format.into();
                (*frames_ctx).width = config.width as i32;
                (*frames_ctx).height = config.height as i32;
                (*frames_ctx).initial_pool_size = 20;

                let mut frames_ref = frames_ref;
                if ffmpeg::ffi::av_hwframe_ctx_init(frames_ref) >= 0 {
                    (*raw).hw_frames_ctx = frames_ref;
                } else {
                    ffmpeg::ffi::av_buffer_unref(&mut frames_ref);
                    return Err(RenderError::hardware_init(
                        "av_hwframe_ctx_init failed".to_string(),
                    ));
                }

                (*raw).pix_fmt = hw_format.into();
                (*raw).sw_pix_fmt = config.pixel_format.into();
            }
        } else {
            // Non-passthrough hardware encoders (VideoToolbox, NVENC fed from
            // system memory) take software frames and upload internally.
            encoder.set_format(config.pixel_format);
            if let Some(device) = &hw_context {
                unsafe {
                    (*encoder.as_mut_ptr()).hw_device_ctx = device.new_ref()?;
                }
            }
        }

        unsafe {
            let raw = encoder.as_mut_ptr();

            // BT.709 limited range; the first frame's own metadata overrides.
            (*raw).color_range = ffmpeg::ffi::AVColorRange::AVCOL_RANGE_MPEG;
            (*raw).color_primaries = ffmpeg::ffi::AVColorPrimaries::AVCOL_PRI_BT709;
            (*raw).color_trc = ffmpeg::ffi::AVColorTransferCharacteristic::AVCOL_TRC_BT709;
            (*raw).colorspace = ffmpeg::ffi::AVColorSpace::AVCOL_SPC_BT709;

            // Hardware passthrough feeds frames in presentation order; with
            // B-frames the dts derivation breaks, so force them off there.
            if (using_hardware && config.expect_hardware_frames)
                || (using_hardware && codec_name.contains("videotoolbox"))
            {
                (*raw).max_b_frames = 0;
            }

            (*raw).thread_count = config.thread_count;
            (*raw).thread_type =
                (ffmpeg::ffi::FF_THREAD_FRAME | ffmpeg::ffi::FF_THREAD_SLICE) as i32;

            if !config.crf_mode() {
                (*raw).bit_rate_tolerance = config.bitrate as i32;
            }
        }

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let async_mode = using_hardware || codec_name.contains("nvenc");
        let options = codec_options(&config, &codec_name, async_mode);

        let mut opened = encoder.open_with(options).map_err(|e| {
            RenderError::codec_unavailable(format!("failed to open {codec_name}: {e}"))
        })?;

        // libavcodec resets the aspect ratio during open; set it afterwards
        // so the stream parameters pick it up.
        unsafe {
            let sar = if codec_name == "libx264" || codec_name == "libx265" {
                ffmpeg::ffi::AVRational { num: 1, den: 1 }
            } else {
                ffmpeg::ffi::AVRational { num: 0, den: 1 }
            };
            (*opened.as_mut_ptr()).sample_aspect_ratio = sar;
        }

        let stream_index;
        {
            let mut ost = octx.add_stream(codec_handle)?;
            stream_index = ost.index();
            ost.set_parameters(&opened);
            ost.set_time_base(codec_time_base);
        }

        octx.write_header().map_err(|e| {
            RenderError::encode_fatal(format!("failed to write container header: {e}"))
        })?;

        let stream_time_base = octx
            .stream(stream_index)
            .expect("stream added above")
            .time_base();

        if async_mode {
            tracing::info!(encoder = %codec_name, "async encoding enabled");
        }
        tracing::info!(
            path = %path.display(),
            encoder = %codec_name,
            width = config.width,
            height = config.height,
            fps = config.fps,
            hardware = using_hardware,
            "encoder initialized"
        );

        Ok(Encoder {
            encoder: opened,
            converted: None,
            hw_upload: None,
            scaler: None,
            hw_context,
            octx,
            config,
            codec_name,
            stream_index,
            stream_time_base,
            codec_time_base,
            using_hardware,
            async_mode,
            frames_in_flight: 0,
            pts: 0,
            frames_written: 0,
            finalized: false,
            color_props_set: false,
        })
    }

    pub fn is_using_hardware(&self) -> bool {
        self.using_hardware
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Encodes one system-memory frame, converting format/geometry on the way
    /// in when it differs from the configured output.
    pub fn write_frame(&mut self, frame: &Video) -> RenderResult<()> {
        if self.finalized {
            return Err(RenderError::encode_fatal("encoder already finalized"));
        }

        self.adopt_color_properties(frame);

        let needs_conversion = frame.format() != self.config.pixel_format
            || frame.width() != self.config.width
            || frame.height() != self.config.height;

        let pts = self.next_pts();
        if needs_conversion {
            self.convert_input(frame)?;
            let mut converted = self.converted.take().expect("convert_input populated it");
            converted.set_pts(Some(pts));
            let result = self.send(Some(&converted));
            self.converted = Some(converted);
            result?;
        } else {
            // The caller keeps its frame; a shallow reference carries the pts.
            let mut staged = Video::empty();
            unsafe {
                let ret = ffmpeg::ffi::av_frame_ref(staged.as_mut_ptr(), frame.as_ptr());
                if ret < 0 {
                    return Err(RenderError::from(ffmpeg::Error::from(ret)));
                }
            }
            staged.set_pts(Some(pts));
            self.send(Some(&staged))?;
        }

        if self.async_mode {
            self.receive_packets_async()?;
        }
        Ok(())
    }

    /// Encodes a frame through the hardware path: GPU-resident input is
    /// shallow-referenced, system-memory input is uploaded first.
    pub fn write_hardware_frame(&mut self, frame: &Video) -> RenderResult<()> {
        if self.finalized {
            return Err(RenderError::encode_fatal("encoder already finalized"));
        }
        if !self.using_hardware {
            tracing::warn!("write_hardware_frame without hardware encoding");
            return self.write_frame(frame);
        }

        self.adopt_color_properties(frame);
        let pts = self.next_pts();

        if hwaccel::is_hardware_frame(frame) {
            let mut staged = Video::empty();
            unsafe {
                let ret = ffmpeg::ffi::av_frame_ref(staged.as_mut_ptr(), frame.as_ptr());
                if ret < 0 {
                    return Err(RenderError::from(ffmpeg::Error::from(ret)));
                }
            }
            staged.set_pts(Some(pts));
            self.send(Some(&staged))?;
        } else {
            self.upload_and_send(frame, pts)?;
        }

        if self.async_mode {
            self.receive_packets_async()?;
        }
        Ok(())
    }

    fn upload_and_send(&mut self, frame: &Video, pts: i64) -> RenderResult<()> {
        let accel = self.config.hw.accel.resolve();
        let hw_format = accel
            .pixel_format()
            .ok_or_else(|| RenderError::hardware_init("accel has no pixel format"))?;

        let mut upload = self.hw_upload.take().unwrap_or_else(Video::empty);
        unsafe {
            let raw = upload.as_mut_ptr();
            ffmpeg::ffi::av_frame_unref(raw);
            let hw_pixfmt: ffmpeg::ffi::AVPixelFormat = hw_format.into();
            (*raw).format = hw_pixfmt as i32;
            (*raw).width = frame.width() as i32;
            (*raw).height = frame.height() as i32;

            let enc = self.encoder.as_mut_ptr();
            let ret = if !(*enc).hw_frames_ctx.is_null() {
                ffmpeg::ffi::av_hwframe_get_buffer((*enc).hw_frames_ctx, raw, 0)
            } else {
                ffmpeg::ffi::av_frame_get_buffer(raw, 32)
            };
            if ret < 0 {
                self.hw_upload = Some(upload);
                return Err(RenderError::hardware_init(format!(
                    "failed to allocate upload frame: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            let ret = ffmpeg::ffi::av_hwframe_transfer_data(raw, frame.as_ptr(), 0);
            if ret < 0 {
                ffmpeg::ffi::av_frame_unref(raw);
                self.hw_upload = Some(upload);
                return Err(RenderError::hardware_init(format!(
                    "failed to upload frame to device: {}",
                    ffmpeg::Error::from(ret)
                )));
            }
        }

        upload.set_pts(Some(pts));
        let result = self.send(Some(&upload));
        unsafe {
            ffmpeg::ffi::av_frame_unref(upload.as_mut_ptr());
        }
        self.hw_upload = Some(upload);
        result
    }

    /// Sends a frame (or EOF on `None`) and drains packets according to mode.
    fn send(&mut self, frame: Option<&Video>) -> RenderResult<()> {
        if self.async_mode {
            return self.send_frame_async(frame);
        }

        match frame {
            Some(frame) => self.encoder.send_frame(frame).map_err(|e| {
                RenderError::encode_fatal(format!("error sending frame to encoder: {e}"))
            })?,
            None => self.encoder.send_eof().map_err(|e| {
                RenderError::encode_fatal(format!("error flushing encoder: {e}"))
            })?,
        }
        self.drain_packets(false)?;
        Ok(())
    }

    fn send_frame_async(&mut self, frame: Option<&Video>) -> RenderResult<()> {
        let sent = match frame {
            Some(frame) => match self.encoder.send_frame(frame) {
                Ok(()) => true,
                // A full submission queue drops the frame, as does a flush
                // overlap; neither is fatal for the stream.
                Err(e) => {
                    tracing::warn!(error = %e, "encoder did not accept frame");
                    false
                }
            },
            None => {
                let _ = self.encoder.send_eof();
                false
            }
        };

        if sent {
            self.frames_in_flight += 1;
            if self.frames_in_flight >= ASYNC_QUEUE_SIZE - 2 {
                self.receive_packets_async()?;
            }
        }
        Ok(())
    }

    /// Pulls every packet the encoder has ready; returns whether any arrived.
    fn receive_packets_async(&mut self) -> RenderResult<bool> {
        let mut received_any = false;
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    self.write_packet(&mut packet)?;
                    self.frames_in_flight = self.frames_in_flight.saturating_sub(1);
                    received_any = true;
                }
                Err(ffmpeg::Error::Eof) => {
                    self.frames_in_flight = 0;
                    break;
                }
                // EAGAIN: nothing ready yet, come back later.
                Err(_) => break,
            }
        }
        Ok(received_any)
    }

    /// Synchronous drain; with `flushing` the EOF marker ends the loop.
    fn drain_packets(&mut self, flushing: bool) -> RenderResult<()> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => self.write_packet(&mut packet)?,
                Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(e) => {
                    // EAGAIN simply means the encoder wants more input.
                    if flushing {
                        tracing::debug!(error = %e, "flush drain ended");
                    }
                    return Ok(());
                }
            }
        }
    }

    fn write_packet(&mut self, packet: &mut ffmpeg::Packet) -> RenderResult<()> {
        packet.rescale_ts(self.codec_time_base, self.stream_time_base);
        packet.set_stream(self.stream_index);
        packet.write_interleaved(&mut self.octx).map_err(|e| {
            RenderError::encode_fatal(format!("error writing packet: {e}"))
        })?;
        self.frames_written += 1;
        Ok(())
    }

    /// Flushes everything in flight and writes the container trailer.
    pub fn finalize(&mut self) -> RenderResult<()> {
        if self.finalized {
            return Ok(());
        }

        if self.async_mode {
            let mut attempts = 0;
            while self.frames_in_flight > 0 && attempts < 100 {
                let received = self.receive_packets_async()?;
                if !received {
                    std::thread::sleep(Duration::from_millis(2));
                }
                attempts += 1;
            }

            let _ = self.encoder.send_eof();

            let mut iterations = 0;
            loop {
                if iterations >= 1000 {
                    tracing::warn!("async flush gave up after {iterations} iterations");
                    break;
                }
                iterations += 1;

                let mut packet = ffmpeg::Packet::empty();
                match self.encoder.receive_packet(&mut packet) {
                    Ok(()) => self.write_packet(&mut packet)?,
                    Err(_) => break,
                }
            }
        } else {
            let _ = self.encoder.send_eof();
            self.drain_packets(true)?;
        }

        self.octx.write_trailer().map_err(|e| {
            RenderError::encode_fatal(format!("failed to write trailer: {e}"))
        })?;

        self.finalized = true;
        tracing::info!(frames = self.frames_written, "encoder finalized");
        Ok(())
    }

    fn next_pts(&mut self) -> i64 {
        let pts = self.pts;
        self.pts += 1;
        pts
    }

    /// The first frame carrying real color metadata overrides the BT.709
    /// defaults configured at setup.
    fn adopt_color_properties(&mut self, frame: &Video) {
        if self.color_props_set {
            return;
        }
        unsafe {
            let raw = frame.as_ptr();
            if (*raw).color_range == ffmpeg::ffi::AVColorRange::AVCOL_RANGE_UNSPECIFIED {
                return;
            }
            let enc = self.encoder.as_mut_ptr();
            (*enc).color_range = (*raw).color_range;
            (*enc).color_primaries = (*raw).color_primaries;
            (*enc).color_trc = (*raw).color_trc;
            (*enc).colorspace = (*raw).colorspace;
        }
        self.color_props_set = true;
    }

    fn convert_input(&mut self, frame: &Video) -> RenderResult<()> {
        let stale = match &self.scaler {
            Some(cached) => {
                cached.src_format != frame.format()
                    || cached.src_width != frame.width()
                    || cached.src_height != frame.height()
            }
            None => true,
        };
        if stale {
            self.scaler = Some(CachedScaler {
                context: scaling::Context::get(
                    frame.format(),
                    frame.width(),
                    frame.height(),
                    self.config.pixel_format,
                    self.config.width,
                    self.config.height,
                    scaling::Flags::BILINEAR,
                )?,
                src_format: frame.format(),
                src_width: frame.width(),
                src_height: frame.height(),
            });
        }

        let mut converted = self.converted.take().unwrap_or_else(|| {
            Video::new(self.config.pixel_format, self.config.width, self.config.height)
        });
        unsafe {
            let ret = ffmpeg::ffi::av_frame_make_writable(converted.as_mut_ptr());
            if ret < 0 {
                return Err(RenderError::from(ffmpeg::Error::from(ret)));
            }
        }

        let scaler = &mut self.scaler.as_mut().expect("created above").context;
        scaler.run(frame, &mut converted)?;

        unsafe {
            ffmpeg::ffi::av_frame_copy_props(converted.as_mut_ptr(), frame.as_ptr());
        }
        self.converted = Some(converted);
        Ok(())
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(e) = self.finalize() {
                tracing::error!(error = %e, "finalize during teardown failed");
            }
        }

        if self.async_mode && self.using_hardware {
            // Safety drain: any packet the driver is still holding gets
            // discarded so codec close cannot block on them.
            for _ in 0..100 {
                let mut packet = ffmpeg::Packet::empty();
                if self.encoder.receive_packet(&mut packet).is_err() {
                    break;
                }
            }
            self.frames_in_flight = 0;
        }

        if self.using_hardware {
            tracing::debug!(encoder = %self.codec_name, "closing hardware encoder");
            unsafe {
                ffmpeg::ffi::avcodec_close(self.encoder.as_mut_ptr());
            }
            // Let in-flight GPU work settle before the context is freed.
            std::thread::sleep(Duration::from_millis(100));
        }
        // Remaining teardown rides field drop order: codec context, scratch
        // frames, device context reference, muxer and IO.
    }
}

fn name_is_hardware(name: &str) -> bool {
    name.contains("nvenc")
        || name.contains("vaapi")
        || name.contains("videotoolbox")
        || name.contains("qsv")
}

fn accel_from_name(name: &str) -> HwAccel {
    if name.contains("nvenc") {
        HwAccel::Nvenc
    } else if name.contains("vaapi") {
        HwAccel::Vaapi
    } else if name.contains("videotoolbox") {
        HwAccel::VideoToolbox
    } else {
        HwAccel::None
    }
}

/// Codec private options, passed through `avcodec_open2`. Unknown keys are
/// left unconsumed by libav rather than failing the open.
fn codec_options(config: &EncoderConfig, codec_name: &str, async_mode: bool) -> Dictionary<'static> {
    let mut opts = Dictionary::new();

    if codec_name == "libx264" || codec_name == "libx265" {
        opts.set("preset", &config.preset);
        if config.crf_mode() {
            opts.set("crf", &config.crf.unwrap_or(23).to_string());
        }
    } else if codec_name.contains("nvenc") {
        opts.set("preset", "p4");
        opts.set("rc", "vbr");
        opts.set("spatial-aq", "1");
        opts.set("temporal-aq", "1");
        opts.set("lookahead", "32");
        if config.crf_mode() {
            opts.set("rc", "constqp");
            opts.set("qp", &config.crf.unwrap_or(23).to_string());
        }
        if async_mode {
            opts.set("delay", "0");
            opts.set("surfaces", &(ASYNC_QUEUE_SIZE * 2).to_string());
        }
    } else if codec_name.contains("vaapi") {
        opts.set("rc_mode", "VBR");
        if config.crf_mode() {
            opts.set("rc_mode", "CQP");
            opts.set("qp", &config.crf.unwrap_or(23).to_string());
        }
    } else if codec_name.contains("videotoolbox") {
        opts.set("profile", "main");
        opts.set("allow_sw", "1");
        if config.crf_mode() {
            // VideoToolbox rates quality 0-1, higher is better.
            let quality = 1.0 - f64::from(config.crf.unwrap_or(23)) / 51.0;
            opts.set("quality", &format!("{quality:.3}"));
        }
        if async_mode {
            opts.set("async_depth", &ASYNC_QUEUE_SIZE.to_string());
        }
    }

    opts
}
