mod compositor;
mod decode;
mod encode;
mod error;
mod frame_pool;
mod hwaccel;
mod instruction;
mod model;
mod parse;
mod render;

pub use compositor::Compositor;
pub use decode::{Decoder, DecoderConfig};
pub use encode::{Encoder, EncoderConfig};
pub use error::{RenderError, RenderResult};
pub use frame_pool::{FramePool, PoolStats, PooledFrame};
pub use hwaccel::{
    best_accel_type, is_hardware_format, is_hardware_frame, reset_shared_context, shared_context,
    HwAccel, HwConfig, HwDeviceContext,
};
pub use instruction::{
    Effect, EffectKind, Geometry, Instruction, InstructionGenerator, InstructionKind, Instructions,
    Rgb, TransitionInfo, TransitionKind,
};
pub use model::{
    Clip, Edl, EffectFilter, EffectSource, FilterControlPoint, GenerateKind, GenerateSource,
    MappingPair, MediaSource, Motion, ShapeControlPoint, SimpleEffect, Source, SubtitleSource,
    TextFormat, Track, TrackType, TransformSource, Transition,
};
pub use parse::{parse_file, parse_value};
pub use render::{
    requires_cpu_processing, resolve_media_uri, RenderOptions, RenderStats, Renderer,
};
