//! Example: Real-time session with separate capture and playback threads
//!
//! Plays an input file through a [`RealtimeSession`] at wall-clock speed: a capture
//! thread pushes 10 ms blocks, the main thread pulls 10 ms blocks as a playback
//! callback would, and inference runs on the session's worker thread.
//!
//! Usage: cargo run --example realtime -- input.wav output.wav [model.onnx]

use enhance_rt::{CancelToken, InferenceEngine, InferenceError, ModelShape, PipelineConfig, RealtimeSession, ScriptedEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn loader(
    model: Option<PathBuf>,
    shape: ModelShape,
) -> impl FnOnce(&CancelToken) -> Result<Box<dyn InferenceEngine>, InferenceError> + Send + 'static {
    move |_cancel: &CancelToken| -> Result<Box<dyn InferenceEngine>, InferenceError> {
        match model {
            #[cfg(feature = "onnx")]
            Some(path) => {
                use enhance_rt::onnx::{OnnxEngine, OnnxOptions};
                Ok(Box::new(OnnxEngine::from_file(&path, shape, OnnxOptions::default())?))
            }
            #[cfg(not(feature = "onnx"))]
            Some(path) => {
                eprintln!("Ignoring model {:?}: built without the `onnx` feature", path);
                Ok(Box::new(ScriptedEngine::transparent(shape)))
            }
            None => Ok(Box::new(ScriptedEngine::transparent(shape))),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [model.onnx]", args[0]);
        std::process::exit(1);
    }

    let config = PipelineConfig::default();
    let hop = config.hop_size;
    let sample_rate = config.sample_rate;
    let block_duration = config.hop_duration();

    let mut reader = hound::WavReader::open(&args[1])?;
    let spec = reader.spec();
    if spec.sample_rate != sample_rate as u32 {
        eprintln!("Warning: Input sample rate {} != expected {}. Resample first!", spec.sample_rate, sample_rate);
    }
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / (1i64 << (spec.bits_per_sample - 1)) as f32))
            .collect::<Result<_, _>>()?,
    };
    let mono: Vec<f32> = samples.chunks(spec.channels as usize).map(|c| c.iter().sum::<f32>() / c.len() as f32).collect();

    let shape = ModelShape::from_config(&config);
    let session = Arc::new(RealtimeSession::spawn(config, loader(args.get(3).map(PathBuf::from), shape))?);
    session.wait_until_running(Duration::from_secs(30))?;
    println!(
        "Session running; streaming {:.2}s of audio in {:.1}ms blocks",
        mono.len() as f32 / sample_rate as f32,
        block_duration.as_secs_f64() * 1000.0
    );

    // ── Capture thread ────────────────────────────────────────────────
    let capture = {
        let session = Arc::clone(&session);
        let input = mono.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            for (i, block) in input.chunks(hop).enumerate() {
                if let Err(e) = session.push(block) {
                    eprintln!("push failed: {}", e);
                    break;
                }
                let next = start + block_duration * (i as u32 + 1);
                std::thread::sleep(next.saturating_duration_since(Instant::now()));
            }
        })
    };

    // ── Playback loop ─────────────────────────────────────────────────
    // Start two blocks late so the worker has something to hand out.
    std::thread::sleep(block_duration * 2);
    let mut output = Vec::with_capacity(mono.len());
    let mut block = vec![0.0f32; hop];
    let start = Instant::now();
    let blocks = mono.len().div_ceil(hop) + 1;
    for i in 0..blocks {
        session.pull(&mut block);
        output.extend_from_slice(&block);
        let next = start + block_duration * (i as u32 + 1);
        std::thread::sleep(next.saturating_duration_since(Instant::now()));
    }
    capture.join().map_err(|_| "capture thread panicked")?;

    let t = session.telemetry();
    println!(
        "Frames: {}, avg: {:.2}ms, max: {:.2}ms, underrun samples: {}, dropped: {}, overflows: {}, trips: {}",
        t.frames_processed,
        t.average_frame_latency.as_secs_f64() * 1000.0,
        t.max_frame_latency.as_secs_f64() * 1000.0,
        t.underrun_samples,
        t.dropped_output_samples,
        t.overflow_events,
        t.circuit_breaker_trips
    );

    let out_spec = hound::WavSpec {
        channels: 1,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&args[2], out_spec)?;
    for sample in &output {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    println!("Saved to {}", args[2]);

    match Arc::try_unwrap(session) {
        Ok(session) => session.stop()?,
        Err(_) => eprintln!("session still shared; dropping"),
    }
    Ok(())
}
