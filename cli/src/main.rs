use chirpwave_core::bits::{bits_from_bytes, bytes_from_bits};
use chirpwave_core::{
    format_bits, parse_bits, run_loopback, Decoder, Encoder, LoopbackConfig, ModemConfig,
    ModemError, Params,
};
use clap::{Parser, Subcommand};
use hound::{SampleFormat, WavSpec};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "chirpwave")]
#[command(about = "Chirp-synchronized multi-tone acoustic modem")]
struct Cli {
    /// JSON modem profile; missing fields take their defaults
    #[arg(long, global = true, value_name = "PROFILE.JSON")]
    config: Option<PathBuf>,

    /// Start from the 8 kHz voice-band profile instead of the default one
    #[arg(long, global = true)]
    voice_band: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode bits into a WAV file
    Encode {
        /// Payload as a string of 0s and 1s
        #[arg(value_name = "BITS", required_unless_present = "input")]
        bits: Option<String>,

        /// Read the payload bytes from a file instead
        #[arg(short, long, value_name = "FILE", conflicts_with = "bits")]
        input: Option<PathBuf>,

        /// Output WAV file
        #[arg(short, long, value_name = "OUTPUT.WAV")]
        output: PathBuf,
    },

    /// Decode a WAV recording
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Write the payload as bytes instead of printing the bits
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Print the derived band and symbol geometry
    Geometry,

    /// Send bits through a simulated sound card and decode them live
    Loopback {
        /// Payload as a string of 0s and 1s
        #[arg(value_name = "BITS")]
        bits: String,

        /// Samples per device callback
        #[arg(long, default_value = "256")]
        block_size: usize,

        /// Playback-to-capture delay in samples
        #[arg(long, default_value = "0")]
        latency: usize,

        /// Simulated clock speed relative to real time
        #[arg(long, default_value = "1.0")]
        speed: f64,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Modem(#[from] ModemError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}: {source}", path.display())]
    Wav { path: PathBuf, source: hound::Error },

    #[error("invalid profile {}: {source}", path.display())]
    Profile {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0}")]
    Unsupported(String),

    #[error("loopback sent {sent} but received {received}")]
    Mismatch { sent: String, received: String },
}

type CliResult<T> = Result<T, CliError>;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let config = load_config(cli.config.as_deref(), cli.voice_band)?;
    let params = Params::derive(&config)?;

    match cli.command {
        Commands::Encode {
            bits,
            input,
            output,
        } => {
            let payload = match (bits, input) {
                (_, Some(path)) => bits_from_bytes(&read_file(&path)?),
                (Some(text), None) => parse_bits(&text)?,
                (None, None) => Vec::new(),
            };
            encode_command(&params, &payload, &output)
        }
        Commands::Decode { input, output } => decode_command(&params, &input, output.as_deref()),
        Commands::Geometry => {
            print_geometry(&params);
            Ok(())
        }
        Commands::Loopback {
            bits,
            block_size,
            latency,
            speed,
        } => {
            let loopback = LoopbackConfig {
                block_size,
                latency,
                speed,
            };
            loopback_command(&params, &parse_bits(&bits)?, &loopback)
        }
    }
}

fn load_config(path: Option<&Path>, voice_band: bool) -> CliResult<ModemConfig> {
    let Some(path) = path else {
        return Ok(if voice_band {
            ModemConfig::voice_band()
        } else {
            ModemConfig::default()
        });
    };

    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_owned(),
        source,
    })?;
    let profile_error = |source: serde_json::Error| CliError::Profile {
        path: path.to_owned(),
        source,
    };
    let config: ModemConfig = if voice_band {
        // Layer the file over the voice-band profile rather than the default one.
        let mut base = serde_json::to_value(ModemConfig::voice_band()).map_err(profile_error)?;
        let overrides: serde_json::Value = serde_json::from_str(&text).map_err(profile_error)?;
        if let (Some(base), Some(overrides)) = (base.as_object_mut(), overrides.as_object()) {
            for (key, value) in overrides {
                base.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(base).map_err(profile_error)?
    } else {
        serde_json::from_str(&text).map_err(profile_error)?
    };

    log::info!("loaded modem profile from {}", path.display());
    Ok(config)
}

fn read_file(path: &Path) -> CliResult<Vec<u8>> {
    std::fs::read(path).map_err(|source| CliError::Io {
        path: path.to_owned(),
        source,
    })
}

fn encode_command(params: &Params, payload: &[bool], output: &Path) -> CliResult<()> {
    let samples = Encoder::new(params).encode(payload)?;
    println!(
        "Encoded {} bits into {} samples ({:.2} s)",
        payload.len(),
        samples.len(),
        samples.len() as f64 / params.sample_rate()
    );

    let spec = WavSpec {
        channels: 1,
        sample_rate: params.config().sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let wav_error = |source: hound::Error| CliError::Wav {
        path: output.to_owned(),
        source,
    };

    let mut writer = hound::WavWriter::create(output, spec).map_err(wav_error)?;
    for sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer
            .write_sample((clamped * i16::MAX as f32) as i16)
            .map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)?;

    println!("Wrote {}", output.display());
    Ok(())
}

/// Read a WAV file as mono `f32` samples, keeping the first channel.
fn read_wav(path: &Path, expected_rate: u32) -> CliResult<Vec<f32>> {
    let wav_error = |source: hound::Error| CliError::Wav {
        path: path.to_owned(),
        source,
    };
    let mut reader = hound::WavReader::open(path).map_err(wav_error)?;
    let spec = reader.spec();
    log::info!(
        "{}: {} Hz, {} channels, {} bits {:?}",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample,
        spec.sample_format
    );

    if spec.sample_rate != expected_rate {
        return Err(CliError::Unsupported(format!(
            "{} is sampled at {} Hz, the profile expects {} Hz",
            path.display(),
            spec.sample_rate,
            expected_rate
        )));
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()
            .map_err(wav_error)?,
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(wav_error)?,
        (format, bits) => {
            return Err(CliError::Unsupported(format!(
                "{} uses {} bit {:?} samples; 16-bit PCM or 32-bit float is required",
                path.display(),
                bits,
                format
            )))
        }
    };

    Ok(interleaved
        .into_iter()
        .step_by(spec.channels.max(1) as usize)
        .collect())
}

fn decode_command(params: &Params, input: &Path, output: Option<&Path>) -> CliResult<()> {
    let samples = read_wav(input, params.config().sample_rate)?;
    println!("Read {} samples from {}", samples.len(), input.display());

    let bits = Decoder::new(params).decode(&samples)?;
    println!("Decoded {} bits", bits.len());

    match output {
        Some(path) => {
            if bits.len() % 8 != 0 {
                log::warn!("{} bits do not fill whole bytes; last byte is zero-padded", bits.len());
            }
            let bytes = bytes_from_bits(&bits);
            std::fs::write(path, &bytes).map_err(|source| CliError::Io {
                path: path.to_owned(),
                source,
            })?;
            println!("Wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => println!("{}", format_bits(&bits)),
    }
    Ok(())
}

fn print_geometry(params: &Params) {
    let config = params.config();
    println!("sample rate        {} Hz", config.sample_rate);
    println!("band domain        {} - {} Hz", config.low_freq, config.high_freq);
    println!("bands              {} x {} Hz", params.band_count(), params.band_width());
    println!("states per band    {} ({} Hz step)", params.states_per_band(), config.freq_step);
    println!("alphabet           {}", params.symbol_alphabet_size());
    println!("bits per symbol    {}", params.bits_per_symbol());
    println!(
        "symbol             {} samples ({} s)",
        params.samples_per_symbol(),
        config.symbol_duration
    );
    println!(
        "preamble           {} samples, {} -> {} Hz",
        params.preamble_samples(),
        config.preamble_start_freq,
        config.preamble_end_freq
    );
    println!("guard gap          {} samples", params.guard_samples());
    println!("length field       {} bits", params.length_field_bits());
    println!(
        "bit rate           {:.1} bit/s",
        params.bits_per_symbol() as f64 / config.symbol_duration
    );
}

fn loopback_command(params: &Params, bits: &[bool], loopback: &LoopbackConfig) -> CliResult<()> {
    println!(
        "Sending {} bits through a simulated device ({} samples/block, {} samples latency)",
        bits.len(),
        loopback.block_size,
        loopback.latency
    );
    let received = run_loopback(params, bits, loopback)?;
    println!("Received {}", format_bits(&received));
    compare_loopback(bits, &received)?;
    println!("Loopback OK");
    Ok(())
}

fn compare_loopback(sent: &[bool], received: &[bool]) -> CliResult<()> {
    if sent != received {
        return Err(CliError::Mismatch {
            sent: format_bits(sent),
            received: format_bits(received),
        });
    }
    Ok(())
}
