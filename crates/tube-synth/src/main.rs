mod config;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tube_core::backend::{AudioBackend, CpalBackend, OfflineBackend};
use tube_core::mic::MicPassthrough;
use tube_core::pressure_model::{mode_count, PressureModel};
use tube_core::resonance::{harmonic_series, quarter_wave_modes, resonant_frequencies};
use tube_core::router::{AudioRouter, AudioSource};
use tube_core::spectrum::dominant_frequencies;
use tube_core::state::ChannelBank;
use tube_core::synth::ToneSynth;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "tube-synth")]
#[command(about = "Tone, microphone and pressure-profile audio for a resonant tube")]
struct Cli {
    /// TOML config file; missing means defaults
    #[arg(short, long, global = true, default_value = "tube-synth.toml")]
    config: PathBuf,

    /// Log filter, e.g. "debug" or "tube_core=trace" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true)]
    sample_rate: Option<u32>,

    #[arg(long, global = true)]
    block_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play live on the audio device until Enter is pressed
    Run {
        #[arg(short, long)]
        source: Option<AudioSource>,

        /// Stop after this many seconds instead of waiting for Enter
        #[arg(long)]
        seconds: Option<f64>,
    },

    /// Render a source offline to a WAV file
    Render {
        #[arg(short, long)]
        source: Option<AudioSource>,

        #[arg(long, default_value = "10")]
        seconds: f64,

        #[arg(short, long, default_value = "tube.wav")]
        out: PathBuf,
    },

    /// Print the tube resonances and the decomposition basis
    Modes {
        #[arg(short = 'n', long, default_value = "8")]
        count: usize,
    },
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("bad log level '{level}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn build_router(config: &AppConfig, backend: Box<dyn AudioBackend>) -> Result<AudioRouter> {
    let sample_rate = config.audio.sample_rate;
    let bank = Arc::new(ChannelBank::new());
    let synth = Arc::new(ToneSynth::from_bank(sample_rate, &bank)?);
    let mic = Arc::new(MicPassthrough::new(sample_rate, config.mic.clone())?);
    let pressure = Arc::new(PressureModel::new(
        &config.tube,
        config.pressure.clone(),
        bank.clone(),
    )?);
    Ok(AudioRouter::new(
        backend,
        config.audio.clone(),
        bank,
        synth,
        mic,
        pressure,
    ))
}

fn run_live(config: &AppConfig, source: AudioSource, seconds: Option<f64>) -> Result<()> {
    let mut router = build_router(config, Box::new(CpalBackend::new()))?;
    router
        .set_source(source)
        .with_context(|| format!("starting {source} source"))?;

    match seconds {
        Some(seconds) => std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0))),
        None => {
            info!("playing; press Enter to stop");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("reading stdin")?;
        }
    }

    let settings = router.settings();
    router.stop()?;
    info!(
        source = %settings.source,
        mic_volume = settings.mic_volume,
        pressure_volume = settings.pressure_volume,
        "stopped"
    );
    Ok(())
}

/// Render on audio time: the pressure animation is stepped by the
/// rendered duration, not the wall clock.
fn render_offline(config: &AppConfig, source: AudioSource, seconds: f64, out: &Path) -> Result<()> {
    let backend = OfflineBackend::new(config.audio.block_size);
    let mut router = build_router(config, Box::new(backend.clone()))?.with_manual_animation();
    router
        .set_source(source)
        .with_context(|| format!("starting {source} source"))?;
    if source == AudioSource::Mic {
        warn!("offline mic render has no input; output will be silent");
    }

    let sample_rate = config.audio.sample_rate;
    let total = (seconds.max(0.0) * sample_rate as f64).round() as usize;
    let chunk = ((router.pressure().cadence().as_secs_f64() * sample_rate as f64) as usize).max(1);
    let mut samples = Vec::with_capacity(total);
    while samples.len() < total {
        let n = chunk.min(total - samples.len());
        samples.extend(backend.pull(n));
        if source == AudioSource::Pressure {
            let elapsed = samples.len() as f64 / sample_rate as f64;
            router.pressure().tick(elapsed)?;
        }
    }
    router.stop()?;

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(out, spec)
        .with_context(|| format!("creating {}", out.display()))?;
    for &s in &samples {
        writer.write_sample(s)?;
    }
    writer
        .finalize()
        .with_context(|| format!("finalizing {}", out.display()))?;
    info!(path = %out.display(), samples = samples.len(), "wav written");

    let tail = &samples[samples.len().saturating_sub(1 << 16)..];
    for (freq, magnitude) in dominant_frequencies(tail, sample_rate, 8) {
        info!(frequency = freq, magnitude, "output peak");
    }
    Ok(())
}

fn print_modes(config: &AppConfig, count: usize) {
    let p = config.tube.sanitized();
    let resonances = resonant_frequencies(&p, count);
    let harmonics = harmonic_series(p.speed_of_sound, p.tube_length, count);
    let basis = quarter_wave_modes(p.speed_of_sound, p.tube_length, mode_count(count));

    println!(
        "tube: L = {:.3} m, c = {:.1} m/s, d = {:.1} mm, hole = {:.1} mm",
        p.tube_length,
        p.speed_of_sound,
        p.tube_diameter * 1000.0,
        p.hole_size * 1000.0
    );
    println!("{:>4}  {:>12}  {:>12}", "n", "network Hz", "n·c/2L Hz");
    for (i, h) in harmonics.iter().enumerate() {
        match resonances.get(i) {
            Some(f) => println!("{:>4}  {:>12.2}  {:>12.2}", i + 1, f, h),
            None => println!("{:>4}  {:>12}  {:>12.2}", i + 1, "-", h),
        }
    }
    let basis: Vec<String> = basis.iter().map(|f| format!("{f:.1}")).collect();
    println!("decomposition basis ({} modes): {}", basis.len(), basis.join(", "));
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(sr) = cli.sample_rate {
        config.audio.sample_rate = sr;
    }
    if let Some(bs) = cli.block_size {
        config.audio.block_size = bs;
    }

    match cli.command {
        Commands::Run { source, seconds } => {
            run_live(&config, source.unwrap_or(config.source), seconds)
        }
        Commands::Render {
            source,
            seconds,
            out,
        } => render_offline(&config, source.unwrap_or(config.source), seconds, &out),
        Commands::Modes { count } => {
            print_modes(&config, count);
            Ok(())
        }
    }
}
