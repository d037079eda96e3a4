//! pcmout-play - play a WAV file through an output session
//!
//! Decodes the whole file up front with `hound`, then feeds it to an
//! [`OutputSession`] backed by the clock-driven simulated device, exercising
//! the same write / period_wait / drain cycle a real player would.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use pcmout::device::ClockDevice;
use pcmout::{OutputSession, SampleFormat, SessionOptions, StreamFormat};
use pcmout_common::{logging, OutputConfig};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Command-line arguments for pcmout-play
#[derive(Parser, Debug)]
#[command(name = "pcmout-play")]
#[command(about = "Play a WAV file through the pcmout buffering pipeline")]
#[command(version)]
struct Args {
    /// WAV file to play
    input: PathBuf,

    /// Config file (overrides PCMOUT_CONFIG and the default search paths)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total output buffer in milliseconds (overrides the config file)
    #[arg(short, long, env = "PCMOUT_BUFFER_MS")]
    buffer_ms: Option<u32>,

    /// Stop immediately at end of file instead of playing out the buffer
    #[arg(long)]
    no_drain: bool,

    /// Bytes offered per write call
    #[arg(long, default_value = "4096")]
    chunk_bytes: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = OutputConfig::resolve(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(buffer_ms) = args.buffer_ms {
        config.buffer_ms = buffer_ms;
    }
    config.validate().context("Invalid configuration")?;
    logging::init(&config.logging.level).context("Failed to initialize logging")?;

    if args.chunk_bytes == 0 {
        bail!("--chunk-bytes must be non-zero");
    }

    let (format, pcm) = read_wav(&args.input)?;
    info!(
        "Playing {} ({:?}, {} channels, {} Hz, {} bytes)",
        args.input.display(),
        format.format,
        format.channels,
        format.rate,
        pcm.len()
    );

    let session = OutputSession::open(
        ClockDevice::new(config.pcm.clone()),
        format,
        SessionOptions::from_config(&config),
    )
    .context("Failed to open output")?;

    let mut offset = 0;
    let mut last_report = Instant::now();
    while offset < pcm.len() {
        let end = (offset + args.chunk_bytes).min(pcm.len());
        let accepted = session.write(&pcm[offset..end]).context("Write failed")?;
        offset += accepted;
        if offset < end {
            session.period_wait().context("Wait for buffer space failed")?;
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            info!(
                "Output time {} ms, delay {} ms, {} bytes to hardware",
                session.output_time_ms(),
                session.get_delay(),
                session.bytes_to_hardware()
            );
            last_report = Instant::now();
        }
    }

    if args.no_drain {
        info!("End of file; closing without drain");
    } else {
        info!("End of file; draining {} ms", session.get_delay());
        session.drain().context("Drain failed")?;
    }

    info!("Played {} ms", session.written_time_ms());
    session.close();
    Ok(())
}

/// Read a WAV file into interleaved native PCM bytes
///
/// 24-bit integer samples are widened to 32 bits.
fn read_wav(path: &Path) -> Result<(StreamFormat, Vec<u8>)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();

    let encoding = (spec.sample_format, spec.bits_per_sample);
    let (sample_format, pcm): (SampleFormat, Vec<u8>) = match encoding {
        (hound::SampleFormat::Int, 8) => {
            let samples = reader.samples::<i8>().collect::<Result<Vec<_>, _>>()?;
            (SampleFormat::S8, samples.iter().map(|s| *s as u8).collect())
        }
        (hound::SampleFormat::Int, 16) => {
            let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
            (SampleFormat::S16Le, samples.iter().flat_map(|s| s.to_le_bytes()).collect())
        }
        (hound::SampleFormat::Int, bits @ (24 | 32)) => {
            let shift = 32 - bits as u32;
            let samples = reader.samples::<i32>().collect::<Result<Vec<_>, _>>()?;
            (
                SampleFormat::S32Le,
                samples.iter().flat_map(|s| (s << shift).to_le_bytes()).collect(),
            )
        }
        (hound::SampleFormat::Float, 32) => {
            let samples = reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?;
            (SampleFormat::Float, samples.iter().flat_map(|s| s.to_ne_bytes()).collect())
        }
        (kind, bits) => bail!("Unsupported WAV encoding: {:?} {} bits", kind, bits),
    };

    Ok((StreamFormat::new(sample_format, spec.channels, spec.sample_rate), pcm))
}
