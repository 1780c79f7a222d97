//! Example: Enhance an audio file with the synchronous pipeline
//!
//! Usage: cargo run --example process_file -- input.wav output.wav [model.onnx] [config.ini]
//!
//! Without the `onnx` feature (or without a model path) the scripted transparent
//! engine is used, which exercises the full signal path without altering audio.

use enhance_rt::{InferenceEngine, ModelShape, Pipeline, PipelineConfig, ScriptedEngine};
use std::path::Path;

fn load_engine(model: Option<&String>, config: &PipelineConfig) -> Result<Box<dyn InferenceEngine>, Box<dyn std::error::Error>> {
    let shape = ModelShape::from_config(config);
    match model {
        #[cfg(feature = "onnx")]
        Some(path) => {
            use enhance_rt::onnx::{OnnxEngine, OnnxOptions};
            Ok(Box::new(OnnxEngine::from_file(Path::new(path), shape, OnnxOptions::default())?))
        }
        #[cfg(not(feature = "onnx"))]
        Some(path) => {
            eprintln!("Ignoring model {}: built without the `onnx` feature", path);
            Ok(Box::new(ScriptedEngine::transparent(shape)))
        }
        None => Ok(Box::new(ScriptedEngine::transparent(shape))),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [model.onnx] [config.ini]", args[0]);
        std::process::exit(1);
    }

    let input_path = &args[1];
    let output_path = &args[2];
    let config = match args.get(4) {
        Some(ini) => PipelineConfig::from_ini_file(Path::new(ini))?,
        None => PipelineConfig::default(),
    };
    let sample_rate = config.sample_rate;

    let engine = load_engine(args.get(3), &config)?;
    println!("Using engine: {}", engine.name());
    let mut pipeline = Pipeline::new(config)?;
    pipeline.start(engine)?;

    let mut reader = hound::WavReader::open(input_path)?;
    let spec = reader.spec();
    println!("Input: {} Hz, {} channels, {:?}", spec.sample_rate, spec.channels, spec.sample_format);
    if spec.sample_rate != sample_rate as u32 {
        eprintln!("Warning: Input sample rate {} != expected {}. Resample first!", spec.sample_rate, sample_rate);
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => match spec.bits_per_sample {
            16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<Result<_, _>>()?,
            24 | 32 => reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / 2147483648.0))
                .collect::<Result<_, _>>()?,
            bits => {
                eprintln!("Unsupported bits per sample: {}", bits);
                std::process::exit(1);
            }
        },
    };
    let mono: Vec<f32> = samples.chunks(spec.channels as usize).map(|c| c.iter().sum::<f32>() / c.len() as f32).collect();

    println!("Processing {} samples ({:.2}s)...", mono.len(), mono.len() as f32 / sample_rate as f32);
    let start = std::time::Instant::now();
    // Feed hop-sized blocks; the ingest buffer only holds a few frames.
    let hop = pipeline.config().hop_size;
    let mut output = Vec::with_capacity(mono.len() + hop);
    for block in mono.chunks(hop) {
        output.extend(pipeline.process_block(block)?);
    }
    output.extend(pipeline.flush()?);
    let elapsed = start.elapsed();

    // Drop the transform delay so output lines up with input.
    let delay = pipeline.config().overlap().min(output.len());
    let output = &output[delay..];

    let rtf = elapsed.as_secs_f32() / (mono.len() as f32 / sample_rate as f32);
    let t = pipeline.telemetry();
    println!("Done in {:.2}s (RTF: {:.3}x realtime)", elapsed.as_secs_f32(), rtf);
    println!(
        "Frames: {}, passthrough: {}, inference failures: {}, avg frame: {:.2}ms",
        t.frames_processed,
        t.passthrough_frames,
        t.inference_failures,
        t.average_frame_latency.as_secs_f64() * 1000.0
    );

    let out_spec = hound::WavSpec {
        channels: 1,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, out_spec)?;
    for sample in output {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;

    println!("Saved to {}", output_path);
    pipeline.stop();
    Ok(())
}
