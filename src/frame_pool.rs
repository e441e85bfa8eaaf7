//! Fixed-geometry frame buffer pool.
//!
//! Frames handed out are writable and carry the pool's declared geometry; a
//! dropped handle pushes its frame back into the available queue (up to
//! capacity) instead of freeing the pixel planes.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::util::frame::video::Video;
use parking_lot::Mutex;

use crate::error::{RenderError, RenderResult};

#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    width: u32,
    height: u32,
    format: Pixel,
    pool_size: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    available: Vec<Video>,
    allocated: usize,
    warnings: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    pub available: usize,
    pub allocated: usize,
}

impl FramePool {
    pub fn new(width: u32, height: u32, format: Pixel, pool_size: usize) -> Self {
        let mut state = PoolState {
            available: Vec::new(),
            allocated: 0,
            warnings: 0,
        };

        // Warm the pool so the first frames of a render do not pay the
        // allocation cost.
        let preallocate = (pool_size / 2).min(5);
        for _ in 0..preallocate {
            state.available.push(Video::new(format, width, height));
            state.allocated += 1;
        }
        tracing::debug!(
            width,
            height,
            format = ?format,
            preallocated = state.available.len(),
            "frame pool initialized"
        );

        FramePool {
            inner: Arc::new(PoolInner {
                width,
                height,
                format,
                pool_size,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> Pixel {
        self.inner.format
    }

    /// A writable frame of the pool's geometry, recycled when possible.
    pub fn acquire(&self) -> RenderResult<PooledFrame> {
        let mut state = self.inner.state.lock();

        let mut frame = if let Some(mut frame) = state.available.pop() {
            reset_scratch_metadata(&mut frame);
            frame
        } else {
            let frame = Video::new(self.inner.format, self.inner.width, self.inner.height);
            state.allocated += 1;
            if state.allocated > self.inner.pool_size * 2 && state.warnings < 5 {
                state.warnings += 1;
                tracing::warn!(
                    allocated = state.allocated,
                    pool_size = self.inner.pool_size,
                    "frame pool allocating beyond twice its capacity"
                );
            }
            frame
        };
        drop(state);

        make_writable(&mut frame)?;

        Ok(PooledFrame {
            frame: Some(frame),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            available: state.available.len(),
            allocated: state.allocated,
        }
    }
}

/// Clears per-frame scratch state left over from the previous consumer while
/// keeping the pixel buffer allocation intact.
fn reset_scratch_metadata(frame: &mut Video) {
    unsafe {
        let raw = frame.as_mut_ptr();
        (*raw).pts = 0;
        (*raw).pkt_dts = 0;
        (*raw).duration = 0;
        (*raw).flags = 0;
        (*raw).pict_type = ffmpeg::ffi::AVPictureType::AV_PICTURE_TYPE_NONE;
        (*raw).sample_aspect_ratio = ffmpeg::ffi::AVRational { num: 0, den: 1 };
        (*raw).crop_top = 0;
        (*raw).crop_bottom = 0;
        (*raw).crop_left = 0;
        (*raw).crop_right = 0;
    }
}

fn make_writable(frame: &mut Video) -> RenderResult<()> {
    let ret = unsafe { ffmpeg::ffi::av_frame_make_writable(frame.as_mut_ptr()) };
    if ret < 0 {
        return Err(RenderError::from(ffmpeg::Error::from(ret)));
    }
    Ok(())
}

/// A frame on loan from a [`FramePool`]; returns itself on drop.
pub struct PooledFrame {
    frame: Option<Video>,
    pool: Arc<PoolInner>,
}

impl PooledFrame {
    /// Detaches the frame from the pool; it will be freed normally.
    pub fn into_inner(mut self) -> Video {
        let frame = self.frame.take().expect("pooled frame already taken");
        let mut state = self.pool.state.lock();
        state.allocated = state.allocated.saturating_sub(1);
        frame
    }
}

impl Deref for PooledFrame {
    type Target = Video;

    fn deref(&self) -> &Video {
        self.frame.as_ref().expect("pooled frame already taken")
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut Video {
        self.frame.as_mut().expect("pooled frame already taken")
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };

        let mut state = self.pool.state.lock();

        // Never recycle a frame whose buffer was swapped out from under us.
        let geometry_intact = frame.width() == self.pool.width
            && frame.height() == self.pool.height
            && frame.format() == self.pool.format;

        if geometry_intact && state.available.len() < self.pool.pool_size {
            state.available.push(frame);
        } else {
            state.allocated = state.allocated.saturating_sub(1);
        }
    }
}
