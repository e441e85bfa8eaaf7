//! Hardware acceleration negotiation and the shared device context.
//!
//! A process-wide refcounted device context lets decoders and the encoder
//! exchange GPU frames without a system-memory copy. The manager holds one
//! strong reference; every caller gets its own `av_buffer_ref`'d handle, so
//! teardown order reduces to "drop the manager's reference last, before
//! process exit".

use std::ffi::CString;
use std::fmt;
use std::ptr;
use std::str::FromStr;

use ffmpeg_next as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::Pixel;
use ffmpeg::util::frame::video::Video;
use parking_lot::Mutex;

use crate::error::{RenderError, RenderResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwAccel {
    Auto,
    None,
    Nvenc,
    Vaapi,
    VideoToolbox,
}

impl FromStr for HwAccel {
    type Err = RenderError;

    fn from_str(s: &str) -> RenderResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(HwAccel::Auto),
            "none" => Ok(HwAccel::None),
            "nvenc" | "cuda" => Ok(HwAccel::Nvenc),
            "vaapi" => Ok(HwAccel::Vaapi),
            "videotoolbox" | "vt" => Ok(HwAccel::VideoToolbox),
            other => Err(RenderError::hardware_init(format!(
                "unknown hardware accel type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HwAccel::Auto => "auto",
            HwAccel::None => "none",
            HwAccel::Nvenc => "nvenc",
            HwAccel::Vaapi => "vaapi",
            HwAccel::VideoToolbox => "videotoolbox",
        };
        f.write_str(s)
    }
}

impl HwAccel {
    /// Collapses `Auto` to the best type the host actually exposes.
    pub fn resolve(self) -> HwAccel {
        match self {
            HwAccel::Auto => best_accel_type(),
            other => other,
        }
    }

    pub fn device_type(self) -> Option<ffmpeg::ffi::AVHWDeviceType> {
        use ffmpeg::ffi::AVHWDeviceType::*;
        match self {
            HwAccel::Nvenc => Some(AV_HWDEVICE_TYPE_CUDA),
            HwAccel::Vaapi => Some(AV_HWDEVICE_TYPE_VAAPI),
            HwAccel::VideoToolbox => Some(AV_HWDEVICE_TYPE_VIDEOTOOLBOX),
            HwAccel::Auto | HwAccel::None => None,
        }
    }

    /// The hardware pixel format frames live in on this device.
    pub fn pixel_format(self) -> Option<Pixel> {
        match self {
            HwAccel::Nvenc => Some(Pixel::CUDA),
            HwAccel::Vaapi => Some(Pixel::VAAPI),
            HwAccel::VideoToolbox => Some(Pixel::VIDEOTOOLBOX),
            HwAccel::Auto | HwAccel::None => None,
        }
    }

    /// Vendor decoder name for a codec, when one exists. NVIDIA ships
    /// dedicated CUVID decoders; VAAPI and VideoToolbox decode through the
    /// standard decoder plus a device context.
    pub fn decoder_name(self, codec_id: codec::Id) -> Option<&'static str> {
        match self {
            HwAccel::Nvenc => match codec_id {
                codec::Id::H264 => Some("h264_cuvid"),
                codec::Id::HEVC => Some("hevc_cuvid"),
                codec::Id::VP9 => Some("vp9_cuvid"),
                codec::Id::AV1 => Some("av1_cuvid"),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn encoder_name(self, codec_id: codec::Id) -> Option<&'static str> {
        match (self, codec_id) {
            (HwAccel::Nvenc, codec::Id::H264) => Some("h264_nvenc"),
            (HwAccel::Nvenc, codec::Id::HEVC) => Some("hevc_nvenc"),
            (HwAccel::Nvenc, codec::Id::AV1) => Some("av1_nvenc"),
            (HwAccel::Vaapi, codec::Id::H264) => Some("h264_vaapi"),
            (HwAccel::Vaapi, codec::Id::HEVC) => Some("hevc_vaapi"),
            (HwAccel::VideoToolbox, codec::Id::H264) => Some("h264_videotoolbox"),
            (HwAccel::VideoToolbox, codec::Id::HEVC) => Some("hevc_videotoolbox"),
            _ => None,
        }
    }
}

/// Probes the hardware device types libav was built with and prefers
/// NVENC > VideoToolbox > VAAPI.
pub fn best_accel_type() -> HwAccel {
    use ffmpeg::ffi::AVHWDeviceType::*;

    let mut found_vaapi = false;
    let mut found_vt = false;

    let mut current = AV_HWDEVICE_TYPE_NONE;
    loop {
        current = unsafe { ffmpeg::ffi::av_hwdevice_iterate_types(current) };
        match current {
            AV_HWDEVICE_TYPE_NONE => break,
            AV_HWDEVICE_TYPE_CUDA => return HwAccel::Nvenc,
            AV_HWDEVICE_TYPE_VIDEOTOOLBOX => found_vt = true,
            AV_HWDEVICE_TYPE_VAAPI => found_vaapi = true,
            _ => {}
        }
    }

    if found_vt {
        HwAccel::VideoToolbox
    } else if found_vaapi {
        HwAccel::Vaapi
    } else {
        HwAccel::None
    }
}

pub fn is_hardware_format(format: Pixel) -> bool {
    matches!(
        format,
        Pixel::CUDA | Pixel::VAAPI | Pixel::VIDEOTOOLBOX | Pixel::QSV | Pixel::VULKAN
    )
}

pub fn is_hardware_frame(frame: &Video) -> bool {
    is_hardware_format(frame.format())
}

/// One strong reference to an `AVBufferRef`-backed hardware device context.
pub struct HwDeviceContext {
    buf: *mut ffmpeg::ffi::AVBufferRef,
    accel: HwAccel,
}

// The underlying AVBuffer is refcounted with atomic operations; handing
// references across threads is how libav itself shares device contexts.
unsafe impl Send for HwDeviceContext {}

impl HwDeviceContext {
    pub fn create(accel: HwAccel, device_index: i32) -> RenderResult<Self> {
        let accel = accel.resolve();
        let device_type = accel.device_type().ok_or_else(|| {
            RenderError::hardware_init(format!("no device type for accel '{accel}'"))
        })?;

        // CUDA addresses adapters by ordinal; the other backends pick their
        // own default device.
        let device_arg = if accel == HwAccel::Nvenc {
            Some(CString::new(device_index.to_string()).expect("index is ascii"))
        } else {
            None
        };

        let mut buf: *mut ffmpeg::ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffmpeg::ffi::av_hwdevice_ctx_create(
                &mut buf,
                device_type,
                device_arg.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || buf.is_null() {
            return Err(RenderError::hardware_init(format!(
                "av_hwdevice_ctx_create failed for {accel}: {}",
                ffmpeg::Error::from(ret)
            )));
        }

        tracing::info!(accel = %accel, device_index, "hardware device context created");
        Ok(HwDeviceContext { buf, accel })
    }

    pub fn accel(&self) -> HwAccel {
        self.accel
    }

    pub fn as_ptr(&self) -> *mut ffmpeg::ffi::AVBufferRef {
        self.buf
    }

    /// A new strong reference suitable for `hw_device_ctx` assignment. The
    /// caller-side reference is consumed by libav; this handle keeps its own.
    pub fn new_ref(&self) -> RenderResult<*mut ffmpeg::ffi::AVBufferRef> {
        let r = unsafe { ffmpeg::ffi::av_buffer_ref(self.buf) };
        if r.is_null() {
            return Err(RenderError::hardware_init(
                "av_buffer_ref returned null".to_string(),
            ));
        }
        Ok(r)
    }
}

impl Clone for HwDeviceContext {
    fn clone(&self) -> Self {
        let buf = unsafe { ffmpeg::ffi::av_buffer_ref(self.buf) };
        assert!(!buf.is_null(), "av_buffer_ref failed");
        HwDeviceContext {
            buf,
            accel: self.accel,
        }
    }
}

impl Drop for HwDeviceContext {
    fn drop(&mut self) {
        unsafe {
            ffmpeg::ffi::av_buffer_unref(&mut self.buf);
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HwConfig {
    pub accel: HwAccel,
    pub device_index: i32,
    pub allow_fallback: bool,
}

impl Default for HwConfig {
    fn default() -> Self {
        HwConfig {
            accel: HwAccel::Auto,
            device_index: 0,
            allow_fallback: true,
        }
    }
}

static SHARED_CONTEXT: Mutex<Option<HwDeviceContext>> = Mutex::new(None);

/// Lazily initializes the process-wide device context and returns a
/// refcounted handle to it. A request with a different resolved type resets
/// the previous context first.
pub fn shared_context(config: &HwConfig) -> RenderResult<HwDeviceContext> {
    let accel = config.accel.resolve();
    if accel == HwAccel::None {
        return Err(RenderError::hardware_init(
            "no hardware acceleration available".to_string(),
        ));
    }

    let mut slot = SHARED_CONTEXT.lock();

    if let Some(existing) = slot.as_ref() {
        if existing.accel() == accel {
            return Ok(existing.clone());
        }
        tracing::warn!(
            current = %existing.accel(),
            requested = %accel,
            "shared hardware context type changed, resetting"
        );
        *slot = None;
    }

    let context = HwDeviceContext::create(accel, config.device_index)?;
    let handle = context.clone();
    *slot = Some(context);
    Ok(handle)
}

/// Drops the manager's strong reference. Must run before process teardown so
/// GPU driver cleanup does not race static destruction.
pub fn reset_shared_context() {
    let mut slot = SHARED_CONTEXT.lock();
    if slot.take().is_some() {
        tracing::debug!("shared hardware context reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accel_type_parses_aliases() {
        assert_eq!("auto".parse::<HwAccel>().unwrap(), HwAccel::Auto);
        assert_eq!("NVENC".parse::<HwAccel>().unwrap(), HwAccel::Nvenc);
        assert_eq!("cuda".parse::<HwAccel>().unwrap(), HwAccel::Nvenc);
        assert_eq!("vt".parse::<HwAccel>().unwrap(), HwAccel::VideoToolbox);
        assert!("quantum".parse::<HwAccel>().is_err());
    }

    #[test]
    fn decoder_names_are_cuvid_only() {
        assert_eq!(
            HwAccel::Nvenc.decoder_name(codec::Id::H264),
            Some("h264_cuvid")
        );
        assert_eq!(HwAccel::Vaapi.decoder_name(codec::Id::H264), None);
        assert_eq!(HwAccel::VideoToolbox.decoder_name(codec::Id::HEVC), None);
    }

    #[test]
    fn encoder_names_cover_the_matrix() {
        assert_eq!(
            HwAccel::Nvenc.encoder_name(codec::Id::H264),
            Some("h264_nvenc")
        );
        assert_eq!(
            HwAccel::Vaapi.encoder_name(codec::Id::HEVC),
            Some("hevc_vaapi")
        );
        assert_eq!(
            HwAccel::VideoToolbox.encoder_name(codec::Id::H264),
            Some("h264_videotoolbox")
        );
        assert_eq!(HwAccel::Nvenc.encoder_name(codec::Id::VP8), None);
    }

    #[test]
    fn hardware_formats_are_recognized() {
        assert!(is_hardware_format(Pixel::CUDA));
        assert!(is_hardware_format(Pixel::VAAPI));
        assert!(!is_hardware_format(Pixel::YUV420P));
        assert!(!is_hardware_format(Pixel::RGB24));
    }

    #[test]
    fn none_accel_has_no_device_type() {
        assert!(HwAccel::None.device_type().is_none());
        assert!(HwAccel::None.pixel_format().is_none());
    }
}
