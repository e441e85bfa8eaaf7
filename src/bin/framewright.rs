use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use framewright::{
    DecoderConfig, EncoderConfig, HwAccel, HwConfig, RenderError, RenderOptions, Renderer,
};

/// Renders an EDL timeline into a single encoded video file.
#[derive(Parser, Debug)]
#[command(name = "framewright", version)]
struct Cli {
    /// Input EDL JSON file.
    edl: PathBuf,

    /// Output video file; container follows the extension.
    output: PathBuf,

    /// Video codec.
    #[arg(short = 'c', long, default_value = "libx264")]
    codec: String,

    /// Video bitrate in bits per second.
    #[arg(short = 'b', long, default_value_t = 446_464)]
    bitrate: usize,

    /// Encoder preset.
    #[arg(short = 'p', long, default_value = "faster")]
    preset: String,

    /// Constant Rate Factor mode (disables bitrate).
    #[arg(long)]
    crf: Option<i32>,

    /// Hardware acceleration type.
    #[arg(long = "hw-accel", default_value = "auto")]
    hw_accel: String,

    /// Hardware device index.
    #[arg(long = "hw-device", default_value_t = 0)]
    hw_device: i32,

    /// Enable hardware decoding.
    #[arg(long = "hw-decode")]
    hw_decode: bool,

    /// Enable hardware encoding.
    #[arg(long = "hw-encode")]
    hw_encode: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Suppress all non-error output.
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), RenderError> {
    let hw_accel: HwAccel = cli.hw_accel.parse()?;
    let hw = HwConfig {
        accel: hw_accel,
        device_index: cli.hw_device,
        allow_fallback: true,
    };

    tracing::info!(edl = %cli.edl.display(), "parsing EDL");
    let edl = framewright::parse_file(&cli.edl)?;
    tracing::info!(
        width = edl.width,
        height = edl.height,
        fps = edl.fps,
        clips = edl.clips.len(),
        "EDL loaded"
    );

    let encoder = EncoderConfig {
        codec: cli.codec,
        width: edl.width as u32,
        height: edl.height as u32,
        fps: edl.fps,
        // CRF mode zeroes the bitrate so constant quality takes over.
        bitrate: if cli.crf.is_some() { 0 } else { cli.bitrate },
        preset: cli.preset,
        crf: cli.crf,
        use_hardware: cli.hw_encode,
        hw,
        expect_hardware_frames: cli.hw_decode && cli.hw_encode,
        ..EncoderConfig::default()
    };

    let decoder = DecoderConfig {
        use_hardware: cli.hw_decode,
        hw,
        thread_count: 0,
    };

    let media_root = cli.edl.parent().map(PathBuf::from);
    let options = RenderOptions {
        encoder,
        decoder,
        media_root,
    };

    let renderer = Renderer::new(&edl, &cli.output, options)?;
    let stats = renderer.run()?;

    println!(
        "rendered {} frames in {:.2}s ({:.1} fps) -> {}",
        stats.frames_written,
        stats.elapsed.as_secs_f64(),
        stats.avg_fps,
        cli.output.display()
    );

    Ok(())
}
