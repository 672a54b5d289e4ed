use clap::{ArgGroup, Args, Parser, Subcommand};
use intensity_relay::streaming::{AudioTrack, ReductionMode, SerialEncoding};
use intensity_relay::tone_server::DEFAULT_BIND_ADDR;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "intensity-relay",
    version,
    about = "Relay live audio intensity to a level bar and an Arduino over serial",
    long_about = "Reads stereo 16-bit frames from a WAV file, a WebSocket stream or a robot's\n\
                  audio events, reduces them to a normalized intensity and republishes it at a\n\
                  fixed cadence. Pipeline defaults can be set with INTENSITY_* variables or .env."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the intensity pipeline until Ctrl-C
    Run(RunArgs),
    /// List available serial ports
    Ports(PortsArgs),
    /// Serve a 440 Hz test tone as WebSocket frame records
    ToneServer(ToneServerArgs),
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("source")
        .required(true)
        .args(["wav", "ws", "robot"])
))]
pub struct RunArgs {
    /// Play a WAV file
    #[arg(long, value_name = "PATH")]
    pub wav: Option<PathBuf>,

    /// Restart the WAV file when it ends
    #[arg(long = "loop", requires = "wav")]
    pub loop_playback: bool,

    /// WAV pacing: frames are released one chunk every CHUNK_MS (0 = as fast as possible)
    #[arg(long, default_value_t = 50, requires = "wav")]
    pub chunk_ms: u64,

    /// Connect to a WebSocket server sending 4-byte frame records
    #[arg(long, value_name = "URL")]
    pub ws: Option<String>,

    /// Stream audio from a robot's realtime API
    #[arg(long, value_name = "HOST")]
    pub robot: Option<String>,

    /// Robot realtime-API port
    #[arg(long, default_value_t = intensity_relay::streaming::source::DEFAULT_ROBOT_PORT, requires = "robot")]
    pub robot_port: u16,

    /// Robot audio track (speaker or microphone)
    #[arg(long, default_value = "speaker", value_parser = parse_track, requires = "robot")]
    pub track: AudioTrack,

    /// Serial port of the Arduino (e.g. /dev/ttyACM0, COM3)
    #[arg(long, value_name = "PORT")]
    pub serial: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = intensity_relay::streaming::sink::DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Poll interval in milliseconds [env: INTENSITY_CADENCE_MS]
    #[arg(long)]
    pub cadence_ms: Option<u64>,

    /// Reduction rule: abs-average, rms or max-abs [env: INTENSITY_MODE]
    #[arg(long)]
    pub mode: Option<ReductionMode>,

    /// Amplitude that maps to full intensity, e.g. 32768 or 30000 [env: INTENSITY_CLAMP_CEILING]
    #[arg(long)]
    pub ceiling: Option<f32>,

    /// Serial level encoding: line or byte [env: INTENSITY_SERIAL_ENCODING]
    #[arg(long)]
    pub serial_encoding: Option<SerialEncoding>,

    /// Bound of the source queue [env: INTENSITY_QUEUE_CAPACITY]
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Do not draw the level bar
    #[arg(long)]
    pub no_bar: bool,
}

#[derive(Args)]
pub struct PortsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ToneServerArgs {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    pub bind: String,

    /// Tone frequency in Hz
    #[arg(long, default_value_t = 440.0)]
    pub frequency: f64,

    /// Peak sample value
    #[arg(long, default_value_t = 30000)]
    pub amplitude: i16,

    /// Frames per second
    #[arg(long, default_value_t = 16_000)]
    pub sample_rate: u32,
}

fn parse_track(s: &str) -> Result<AudioTrack, String> {
    match s.to_ascii_lowercase().as_str() {
        "speaker" => Ok(AudioTrack::Speaker),
        "microphone" | "mic" => Ok(AudioTrack::Microphone),
        other => Err(format!(
            "unknown track '{}' (expected speaker or microphone)",
            other
        )),
    }
}
