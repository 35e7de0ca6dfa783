//! Example: Run a WAV file through the block transform
//!
//! Usage: cargo run --example process_file -- input.wav output.wav [config.ini] [preset]
//!
//! `preset` is one of `identity`, `average`, `delay:<blocks>` (default `average`).

use graf_rt::{GrafConfig, GrafStream, Preset};
use std::path::Path;

fn parse_preset(name: &str) -> Option<Preset> {
    match name {
        "identity" => Some(Preset::Identity),
        "average" => Some(Preset::MovingAverage),
        "zeros" => Some(Preset::Zeros),
        _ => name
            .strip_prefix("delay:")
            .and_then(|n| n.parse().ok())
            .map(Preset::Delay),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [config.ini] [preset]", args[0]);
        std::process::exit(1);
    }

    let input_path = &args[1];
    let output_path = &args[2];
    let config = match args.get(3) {
        Some(path) => GrafConfig::from_file(Path::new(path))?,
        None => GrafConfig::default(),
    };
    let preset = match args.get(4) {
        Some(name) => parse_preset(name).ok_or_else(|| format!("unknown preset '{}'", name))?,
        None => Preset::MovingAverage,
    };
    println!(
        "time_size {}, block_size {}, preset {:?}",
        config.time_size, config.block_size, preset
    );

    // Read input audio
    let mut reader = hound::WavReader::open(input_path)?;
    let spec = reader.spec();
    println!("Input: {} Hz, {} channels, {:?}",
             spec.sample_rate, spec.channels, spec.sample_format);

    let samples: Vec<f64> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => match spec.bits_per_sample {
            16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f64 / 32768.0))
                .collect::<Result<_, _>>()?,
            24 | 32 => {
                let scale = (1u64 << (spec.bits_per_sample - 1)) as f64;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f64 / scale))
                    .collect::<Result<_, _>>()?
            }
            _ => {
                eprintln!("Unsupported bits per sample: {}", spec.bits_per_sample);
                std::process::exit(1);
            }
        },
    };

    // Take first channel for multi-channel input
    let mono: Vec<f64> = samples.chunks(spec.channels as usize).map(|c| c[0]).collect();

    let mut stream = GrafStream::new(config, preset)?.with_sample_rate(spec.sample_rate as f64);
    stream.warmup()?;
    if let Some(device) = stream.processor().device() {
        println!("Device: {}", device.name);
    }

    let seconds = mono.len() as f64 / spec.sample_rate as f64;
    println!("Processing {} samples ({:.2}s)...", mono.len(), seconds);

    let start = std::time::Instant::now();
    let mut output = stream.process(&mono);
    output.extend(stream.flush());
    let elapsed = start.elapsed();

    let stats = stream.processor().stats();
    println!("Done in {:.3}s (RTF: {:.4}x realtime)", elapsed.as_secs_f64(), elapsed.as_secs_f64() / seconds);
    println!("Blocks: {}, dispatched: {}, dropped: {}, max block: {:?}",
             stats.blocks, stats.dispatches, stats.dispatch_errors + stats.skipped, stats.max_dispatch);

    // Write output
    let out_spec = hound::WavSpec {
        channels: 1,
        sample_rate: spec.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, out_spec)?;
    for sample in &output {
        let s = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer.write_sample(s)?;
    }
    writer.finalize()?;

    println!("Saved to {}", output_path);
    Ok(())
}
