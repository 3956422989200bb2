//! A capture peer serving generated video and audio.
//!
//! Announces itself like a head-mounted capture app, so a hub can be run
//! end to end without devices.

use bytes::{BufMut, BytesMut};
use clap::Parser;
use eyre::{Result, WrapErr};
use percepsync_core::{
    AudioChunk, AudioFormat, CaptureConfig, CapturePeer, Clock, ImageFrame, SensorPayload,
    SystemClock,
};
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VIDEO_STREAM: &str = "VideoEncodedImageCameraView";
const AUDIO_STREAM: &str = "Audio";

/// Chunk lengths cycled through, so the hub has to reframe.
const CHUNK_MILLIS: [u64; 4] = [10, 30, 25, 15];

#[derive(Debug, Parser)]
#[command(name = "synthetic-capture", version)]
struct Args {
    /// Address of the rendezvous server.
    #[arg(long, default_value = "127.0.0.1:13331")]
    rdzv_server: String,

    /// Host the hub uses to reach this peer.
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Video frames per second.
    #[arg(long, default_value_t = 15.0)]
    fps: f64,

    #[arg(long, default_value_t = 160)]
    width: u32,

    #[arg(long, default_value_t = 120)]
    height: u32,

    /// Frequency of the generated tone, in Hz.
    #[arg(long, default_value_t = 440.0)]
    tone: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    eyre::ensure!(
        args.fps.is_finite() && args.fps > 0.0,
        "--fps must be a positive number"
    );

    let peer = CapturePeer::start(CaptureConfig {
        rendezvous: args.rdzv_server.clone(),
        advertise_host: args.advertise_host.clone(),
        ..CaptureConfig::default()
    })
    .await
    .wrap_err("Failed to start the capture peer")?;
    let peer = Arc::new(peer);
    info!(process = %peer.process().name, "Synthetic capture running");

    let cancel = CancellationToken::new();
    let video = tokio::spawn(generate_video(
        peer.clone(),
        Duration::from_secs_f64(1.0 / args.fps),
        args.width,
        args.height,
        cancel.clone(),
    ));
    let audio = tokio::spawn(generate_audio(peer.clone(), args.tone, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to listen for ctrl-c")?;
    info!("Interrupted, shutting down");

    cancel.cancel();
    let _ = video.await;
    let _ = audio.await;

    match Arc::into_inner(peer) {
        Some(peer) => peer.stop().await,
        None => warn!("Capture peer still in use, not withdrawn"),
    }
    Ok(())
}

/// A moving gradient in 32-bit BGRA.
fn gradient(width: u32, height: u32, shift: u32) -> ImageFrame {
    let stride = width * 4;
    let mut pixels = BytesMut::with_capacity((stride * height) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.put_u8(((x + shift) % 256) as u8);
            pixels.put_u8((y % 256) as u8);
            pixels.put_u8((shift % 256) as u8);
            pixels.put_u8(255);
        }
    }
    ImageFrame {
        width,
        height,
        stride,
        pixel_data: pixels.freeze(),
    }
}

async fn generate_video(
    peer: Arc<CapturePeer>,
    period: Duration,
    width: u32,
    height: u32,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shift = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let frame = SensorPayload::Image(gradient(width, height, shift));
        if let Err(err) = peer.publish(VIDEO_STREAM, SystemClock.now(), &frame) {
            warn!(error = %err, "Failed to publish a frame");
        }
        shift = shift.wrapping_add(4);
    }
}

/// Publishes a sine tone in irregular chunks, each stamped with the time
/// of its last sample.
async fn generate_audio(peer: Arc<CapturePeer>, tone: f64, cancel: CancellationToken) {
    let format = AudioFormat::default();
    let rate = f64::from(format.samples_per_sec);
    let mut sample = 0u64;

    for millis in CHUNK_MILLIS.iter().cycle() {
        let span = Duration::from_millis(*millis);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(span) => {}
        }

        let samples = format.bytes_for(span) / format.block_align();
        let mut data = BytesMut::with_capacity(samples * format.block_align());
        for _ in 0..samples {
            let phase = std::f64::consts::TAU * tone * sample as f64 / rate;
            data.put_i16_le((phase.sin() * f64::from(i16::MAX) * 0.25) as i16);
            sample += 1;
        }

        let chunk = SensorPayload::Audio(AudioChunk::new(data.freeze()));
        if let Err(err) = peer.publish(AUDIO_STREAM, SystemClock.now(), &chunk) {
            warn!(error = %err, "Failed to publish audio");
        }
    }
}
