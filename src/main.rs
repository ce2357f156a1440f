use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use beacon_endpoint::assistant::{Assistant, Components, FileIdentity, SessionIdentity};
use beacon_endpoint::audio::pcm::{bytes_to_samples, samples_to_bytes};
use beacon_endpoint::audio::wav::{samples_to_wav, wav_to_pcm16};
use beacon_endpoint::audio::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE, ReferenceAligner};
use beacon_endpoint::config::{AudioFormat, TransportKind};
use beacon_endpoint::protocol::{
    HttpTransport, Mp3Decoder, PayloadDecoder, Pcm16Decoder, StreamingProtocolClient, Transport,
    WebSocketTransport,
};
use beacon_endpoint::voice::{
    CaptureConfig, CaptureEvent, CaptureSession, CleaningStrategy, CpalMicrophone, CpalSpeaker,
    Microphone, PlaybackConfig, PlaybackEvent, PlaybackSession, Speaker,
};
use beacon_endpoint::Config;

/// Beacon endpoint - voice assistant device core
#[derive(Parser)]
#[command(name = "beacon-endpoint", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Start with the link reported as down
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant with a console UI (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the recording as a WAV file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// Play a WAV file through the playback session
    PlayWav {
        /// Path to the WAV file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_endpoint=info",
        1 => "info,beacon_endpoint=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_assistant(cli.offline).await,
        Command::TestMic { duration, save } => test_mic(duration, save.as_deref()).await,
        Command::TestSpeaker => test_speaker().await,
        Command::PlayWav { path } => play_wav(&path).await,
    }
}

/// Wire the devices, transport and state machine, then drive it from stdin
async fn run_assistant(offline: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    let identity = Arc::new(FileIdentity::load_default()?);
    let reference = Arc::new(ReferenceAligner::new(config.reference_ms, CAPTURE_SAMPLE_RATE)?);

    let microphone: Arc<dyn Microphone> = Arc::new(CpalMicrophone::open()?);
    let speaker: Arc<dyn Speaker> = Arc::new(CpalSpeaker::open()?);

    let (playback, playback_events) = PlaybackSession::new(
        speaker,
        Some(Arc::clone(&reference)),
        config.playback.clone(),
    )?;
    let capture = CaptureSession::new(microphone, config.capture.clone()).with_reference(reference);

    let backend = &config.backend;
    let transport: Arc<dyn Transport> = match backend.transport {
        TransportKind::Http => Arc::new(HttpTransport::new(
            &backend.url,
            backend.token.clone(),
            &config.protocol,
        )?),
        TransportKind::WebSocket => Arc::new(WebSocketTransport::new(
            &backend.url,
            backend.token.clone(),
            &config.protocol,
        )),
    };
    let decoder: Arc<dyn PayloadDecoder> = match backend.audio_format {
        AudioFormat::Pcm16 => Arc::new(Pcm16Decoder),
        AudioFormat::Mp3 => Arc::new(Mp3Decoder),
    };

    let (link, connectivity) = watch::channel(!offline);
    let (client, session_reports) = StreamingProtocolClient::new(
        transport,
        decoder,
        playback.clone(),
        connectivity.clone(),
        config.protocol.clone(),
    );

    let assistant = Assistant::spawn(
        Components {
            capture,
            playback,
            playback_events,
            client,
            session_reports,
            connectivity,
            identity: identity.clone(),
            cleaning: Box::new(|| CleaningStrategy::Passthrough),
        },
        config.assistant.clone(),
    );

    tracing::info!(
        url = %backend.url,
        transport = ?backend.transport,
        variant = %config.assistant.variant,
        device_id = identity.device_id(),
        "beacon endpoint ready"
    );
    println!("Enter: start/stop | c: cancel | v <0-100>: volume | online/offline | q: quit");

    let mut status = assistant.subscribe();
    let printer = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = *status.borrow_and_update();
            println!("[{snapshot}]");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => { assistant.toggle().await?; }
                    "c" => { assistant.cancel().await?; }
                    "q" => break,
                    "online" => { link.send_replace(true); }
                    "offline" => { link.send_replace(false); }
                    other => match other.strip_prefix('v').map(str::trim).map(str::parse::<u8>) {
                        Some(Ok(volume)) => { assistant.set_volume(volume).await?; }
                        _ => println!("unknown command: {other}"),
                    },
                }
            }
        }
    }

    assistant.shutdown().await;
    printer.abort();
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64, save: Option<&Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let microphone = Arc::new(CpalMicrophone::open()?);
    println!("Device channels: {}", microphone.device_channels());
    println!("---");

    let config = CaptureConfig {
        max_duration: Duration::from_secs(duration),
        ..CaptureConfig::default()
    };
    let chunks_per_second = (CAPTURE_SAMPLE_RATE as usize / config.chunk_samples).max(1);
    let mut capture = CaptureSession::new(microphone, config);
    let (sink, mut events) = mpsc::channel(64);
    capture.start(sink, CleaningStrategy::Passthrough)?;

    let mut recorded: Vec<i16> = Vec::new();
    let mut second: Vec<i16> = Vec::new();
    let mut chunks = 0usize;

    while let Some(event) = events.recv().await {
        let CaptureEvent::Chunk(chunk) = event else {
            break;
        };
        let samples = bytes_to_samples(&chunk.data);
        second.extend_from_slice(&samples);
        recorded.extend_from_slice(&samples);
        chunks += 1;

        if chunks % chunks_per_second == 0 || chunk.is_final {
            let energy = calculate_rms(&second);
            let peak = second.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

            // Visual meter
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

            println!(
                "[{:2}s] RMS: {energy:.4} | Peak: {peak:5} | [{meter}]",
                chunks / chunks_per_second
            );
            second.clear();
        }
    }
    capture.join().await;

    if let Some(path) = save {
        std::fs::write(path, samples_to_wav(&recorded, CAPTURE_SAMPLE_RATE)?)?;
        println!("Saved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy of PCM16 samples, normalized to 0..1
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / f32::from(i16::MAX);
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let frequency = 440.0_f32;
    let num_samples = PLAYBACK_SAMPLE_RATE as usize * 2;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            // 30% volume
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 * f32::from(i16::MAX)) as i16
        })
        .collect();

    println!("Playing {} samples at {PLAYBACK_SAMPLE_RATE} Hz...", samples.len());
    play_pcm(samples_to_bytes(&samples)).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Play a WAV file, converted to the playback format
async fn play_wav(path: &Path) -> anyhow::Result<()> {
    let wav = std::fs::read(path)?;
    let samples = wav_to_pcm16(&wav, PLAYBACK_SAMPLE_RATE)?;
    println!("Playing {} ({} samples)...", path.display(), samples.len());
    play_pcm(samples_to_bytes(&samples)).await
}

/// Play one buffer and wait for playback to finish
async fn play_pcm(pcm: Vec<u8>) -> anyhow::Result<()> {
    let speaker: Arc<dyn Speaker> = Arc::new(CpalSpeaker::open()?);
    let (playback, mut events) = PlaybackSession::new(speaker, None, PlaybackConfig::default())?;
    playback.play(pcm)?;

    while let Some(event) = events.recv().await {
        match event {
            PlaybackEvent::Started => tracing::debug!("playback started"),
            PlaybackEvent::Completed => break,
            PlaybackEvent::Error(e) => anyhow::bail!("playback failed: {e}"),
        }
    }

    // let the device flush its last buffer
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(())
}
