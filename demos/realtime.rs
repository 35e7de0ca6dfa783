//! Example: Simulated real-time callback with varying block sizes
//!
//! Usage: cargo run --example realtime -- input.wav output.wav [time_size]
//!
//! Feeds the processor directly, the way an audio host would: one input and
//! one output slice per callback. The callback size cycles through a few
//! values so buffer reallocation shows up in the statistics.

use graf_rt::{GrafConfig, GrafProcessor, Preset};

const CALLBACK_SIZES: [usize; 3] = [64, 128, 64];
const BLOCKS_PER_SIZE: usize = 200;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [time_size]", args[0]);
        std::process::exit(1);
    }

    let input_path = &args[1];
    let output_path = &args[2];
    let time_size = match args.get(3) {
        Some(v) => v.parse()?,
        None => 8,
    };

    let mut reader = hound::WavReader::open(input_path)?;
    let spec = reader.spec();
    let sample_rate = spec.sample_rate as f64;
    println!("Input: {} Hz, {} channels, {:?}",
             spec.sample_rate, spec.channels, spec.sample_format);

    let samples: Vec<f64> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f64::from))
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f64 / (1u64 << (spec.bits_per_sample - 1)) as f64))
            .collect::<Result<_, _>>()?,
    };
    let mono: Vec<f64> = samples.chunks(spec.channels as usize).map(|c| c[0]).collect();

    let config = GrafConfig::new(time_size)?;
    let mut processor = GrafProcessor::with_threads(config, Preset::MovingAverage, 2)?;
    processor.warmup(CALLBACK_SIZES[0])?;
    for d in processor.available_devices()? {
        println!("Device {}: {} ({:?})", d.index, d.name, d.kind);
    }

    let mut out_samples: Vec<f64> = Vec::with_capacity(mono.len());
    let mut out_block = vec![0.0f64; CALLBACK_SIZES.iter().copied().max().unwrap_or(0)];
    let mut latencies_us: Vec<u64> = Vec::new();
    let mut underrun_count: u64 = 0;

    let start = std::time::Instant::now();
    let mut pos = 0;
    let mut callback = 0;
    while pos < mono.len() {
        let n = CALLBACK_SIZES[(callback / BLOCKS_PER_SIZE) % CALLBACK_SIZES.len()].min(mono.len() - pos);
        let budget = std::time::Duration::from_secs_f64(n as f64 / sample_rate);

        let t0 = std::time::Instant::now();
        processor.process(&mono[pos..pos + n], &mut out_block[..n], sample_rate);
        let dt = t0.elapsed();

        latencies_us.push(dt.as_micros() as u64);
        if dt > budget {
            underrun_count += 1;
            eprintln!("UNDERRUN callback {}: {:.3}ms > {:.3}ms budget",
                      callback, dt.as_secs_f64() * 1000.0, budget.as_secs_f64() * 1000.0);
        }
        out_samples.extend_from_slice(&out_block[..n]);
        pos += n;
        callback += 1;
    }

    let elapsed = start.elapsed();
    let seconds = mono.len() as f64 / sample_rate;
    let stats = processor.stats();
    println!("Done in {:.3}s (RTF: {:.4}x realtime)", elapsed.as_secs_f64(), elapsed.as_secs_f64() / seconds);
    println!("Callbacks: {}, reallocations: {}, deadline misses: {}, underruns: {}, max: {:?}",
             callback, stats.reallocations, stats.deadline_misses, underrun_count, stats.max_dispatch);

    let out_spec = hound::WavSpec {
        channels: 1,
        sample_rate: spec.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, out_spec)?;
    for sample in &out_samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    println!("Saved to {}", output_path);

    // Write per-callback latency CSV
    let csv_path = format!("{}.csv", output_path);
    let mut csv = String::from("callback,latency_us,latency_ms\n");
    for (i, &us) in latencies_us.iter().enumerate() {
        csv.push_str(&format!("{},{},{:.3}\n", i, us, us as f64 / 1000.0));
    }
    std::fs::write(&csv_path, &csv)?;
    println!("Latency CSV written to {}", csv_path);

    Ok(())
}
