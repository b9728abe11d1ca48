//! Example: Drive an output through the full lifecycle with synthetic frames.
//!
//! Encodes a short video and audio rendition, keeps the hardware encoder
//! alive, and reuses it for a second rendition.
//!
//! Run with:
//!     cargo run --example transcode_synthetic
//!     cargo run --example transcode_synthetic --features ffmpeg -- out.ts

use anyhow::{Context, Result};
use std::path::Path;
use std::thread;
use transcode_output::codec::MemoryBackend;
use transcode_output::{
    pipeline, ClosePolicy, CodecBackend, CodecParameters, EncoderConfig, FilterContext, Frame,
    HardwareConfig, HardwareEncoders, InputContext, OutputConfig, OutputContext, OutputQueue,
    PixelFormat, Rational, SampleFormat,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const FPS: i32 = 30;
const SAMPLE_RATE: u32 = 48_000;
const SAMPLES_PER_FRAME: u32 = 1024;

fn input() -> InputContext {
    InputContext::new()
        .with_stream(
            Rational::MPEG_TS,
            CodecParameters::video("h264", WIDTH, HEIGHT, Rational::new(FPS, 1)),
        )
        .with_stream(
            Rational::new(1, SAMPLE_RATE as i32),
            CodecParameters::audio("aac", SAMPLE_RATE, 2),
        )
}

fn filters() -> [FilterContext; 2] {
    [
        FilterContext::video(WIDTH, HEIGHT, PixelFormat::Yuv420p, Rational::MILLIS),
        FilterContext::audio(
            SAMPLE_RATE,
            2,
            SampleFormat::F32p,
            Rational::new(1, SAMPLE_RATE as i32),
        ),
    ]
}

/// Encode `seconds` of synthetic media into `target` and close under `policy`.
fn render(
    backend: &dyn CodecBackend,
    target: &str,
    video_codec: EncoderConfig,
    preserved: Option<&mut HardwareEncoders>,
    policy: ClosePolicy,
    seconds: u32,
) -> Result<Option<HardwareEncoders>> {
    let config = OutputConfig::new(target)
        .with_stream(0, video_codec.with_bitrate(2_000_000).with_option("preset", "fast"))
        .with_stream(1, EncoderConfig::new("aac").with_bitrate(128_000));

    let (tx, queue) = OutputQueue::bounded(8);
    let mut output = OutputContext::open(&input(), &config, backend, queue, preserved)
        .with_context(|| format!("Failed to open {}", target))?;

    let producer = thread::spawn(move || -> transcode_output::Result<()> {
        let video_frames = seconds as i64 * FPS as i64;
        let audio_frames = (seconds * SAMPLE_RATE / SAMPLES_PER_FRAME) as i64;
        let (mut v, mut a) = (0i64, 0i64);
        while v < video_frames || a < audio_frames {
            // keep both streams roughly in step, as a demuxer would
            let video_ms = v * 1000 / FPS as i64;
            let audio_ms = a * SAMPLES_PER_FRAME as i64 * 1000 / SAMPLE_RATE as i64;
            if v < video_frames && (video_ms <= audio_ms || a >= audio_frames) {
                let mut frame = Frame::video(WIDTH, HEIGHT, PixelFormat::Yuv420p, video_ms);
                // moving luma gradient
                let luma = (WIDTH * HEIGHT) as usize;
                for (i, px) in frame.data[..luma].iter_mut().enumerate() {
                    *px = ((i as i64 + v * 4) % 256) as u8;
                }
                frame.data[luma..].fill(128);
                tx.send(0, frame)?;
                v += 1;
            } else {
                let pts = a * SAMPLES_PER_FRAME as i64;
                tx.send(
                    1,
                    Frame::audio(SAMPLE_RATE, 2, SampleFormat::F32p, SAMPLES_PER_FRAME, pts),
                )?;
                a += 1;
            }
        }
        tx.finish()
    });

    let stats = pipeline::run(&mut output, &input(), &filters())?;
    producer
        .join()
        .map_err(|_| anyhow::anyhow!("frame producer panicked"))??;

    println!("  {}: {}", target, stats);
    Ok(output.close(policy))
}

fn main() -> Result<()> {
    env_logger::init();

    println!("Transcode Output - Synthetic Example");
    println!("====================================\n");

    let target = std::env::args().nth(1);

    #[cfg(feature = "ffmpeg")]
    let backend: Box<dyn CodecBackend> = match &target {
        Some(_) => Box::new(transcode_output::FfmpegBackend::new()),
        None => Box::new(MemoryBackend::new()),
    };
    #[cfg(not(feature = "ffmpeg"))]
    let backend: Box<dyn CodecBackend> = Box::new(MemoryBackend::new());

    let first = target.unwrap_or_else(|| "rendition_720.ts".to_string());
    let hardware = EncoderConfig::new("h264_nvenc").with_hardware(HardwareConfig::new("cuda"));

    println!("Encoding with hardware encoder, preserving it...");
    let token = match render(
        backend.as_ref(),
        &first,
        hardware.clone(),
        None,
        ClosePolicy::PreserveHardware,
        2,
    ) {
        Ok(token) => token,
        Err(e) => {
            println!("  Hardware encoding unavailable ({:#}), using libx264", e);
            render(
                backend.as_ref(),
                &first,
                EncoderConfig::new("libx264"),
                None,
                ClosePolicy::ForceClose,
                2,
            )?
        }
    };

    if let Some(mut token) = token {
        println!("\nReusing {} preserved encoder(s): {:?}", token.len(), token.codecs());
        let path = Path::new(&first);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Output target has no file name")?;
        let second = path
            .with_file_name(format!("second_{}", name))
            .to_string_lossy()
            .into_owned();
        render(
            backend.as_ref(),
            &second,
            hardware,
            Some(&mut token),
            ClosePolicy::ForceClose,
            1,
        )?;
    }

    println!("\nDone!");
    Ok(())
}
