//! Thin process wire-up: parses configuration, brings up the Bluetooth
//! adapter, spawns the enumerator and coordinator, and drives the
//! configured `Buffer` from a PCM producer.
//!
//! Capturing PCM from the local audio graph is out of scope for this
//! binary; it reads raw interleaved 16-bit stereo PCM from stdin instead
//! and paces it through the configured buffer at one 20ms frame per tick.

use std::io::Read;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use asha::buffer::{self, DeliverFn};
use asha::config::{Args, Config};
use asha::coordinator::Coordinator;
use asha::device::Frame;
use asha::enumerator::{self, ConnectParams};
use asha::gatt_profile::GattProfile;
use asha::monitor::AdvertisementMonitor;
use asha::error::{Error, Result};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = Config::from_args(&args)?;
    tracing::info!(?config, "starting ASHA sink");

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    tracing::info!(adapter = %adapter.name(), "using adapter");

    let coordinator = Coordinator::new();
    let handle = coordinator.spawn();

    let _gatt_profile = if config.reconnect {
        Some(GattProfile::register(&adapter).await?)
    } else {
        None
    };
    let _monitor = if config.reconnect {
        Some(AdvertisementMonitor::register(adapter.clone(), config.rssi_paired, config.rssi_unpaired).await?)
    } else {
        None
    };

    let connect_params = ConnectParams {
        phy1m: config.phy1m,
        phy2m: config.phy2m,
        interval: config.interval,
        timeout: config.timeout,
        celength: config.celength,
    };
    let enumerator_adapter = adapter.clone();
    let enumerator_handle = handle.clone();
    let left_volume = config.left_volume;
    let right_volume = config.right_volume;
    tokio::spawn(async move {
        if let Err(e) = enumerator::run(enumerator_adapter, enumerator_handle, left_volume, right_volume, connect_params).await {
            tracing::error!(error = %e, "enumerator stopped");
        }
    });

    let runtime = tokio::runtime::Handle::current();
    let coordinator_for_deliver = Arc::clone(&coordinator);
    let deliver: DeliverFn = Arc::new(move |frame: &Frame| {
        let coordinator = Arc::clone(&coordinator_for_deliver);
        let frame = *frame;
        runtime.block_on(async move { coordinator.send_audio(&frame).await })
    });
    let audio_buffer = buffer::create(config.buffer_algorithm, deliver);

    let producer = tokio::task::spawn_blocking(move || {
        let mut audio_buffer = audio_buffer;
        run_stdin_producer(&mut *audio_buffer)
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
        result = producer => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "PCM producer task ended unexpectedly");
            }
        }
    }

    Ok(())
}

/// Reads raw interleaved 16-bit little-endian stereo PCM frames (320
/// samples per channel, 1280 bytes per 20ms frame) from stdin and paces
/// them through the configured `Buffer` at one frame per tick.
fn run_stdin_producer(buf: &mut dyn buffer::Buffer) {
    let mut stdin = std::io::stdin().lock();
    let mut raw = [0u8; asha::codec::FRAME_SAMPLES * 2 * 2];
    let mut next_tick = std::time::Instant::now();

    loop {
        if stdin.read_exact(&mut raw).is_err() {
            tracing::info!("stdin closed, stopping PCM producer");
            return;
        }

        let now = std::time::Instant::now();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        }
        next_tick += buffer::FRAME_PERIOD;

        let Some(frame) = buf.next_buffer() else {
            continue;
        };
        for i in 0..asha::codec::FRAME_SAMPLES {
            frame.left[i] = i16::from_le_bytes([raw[i * 4], raw[i * 4 + 1]]);
            frame.right[i] = i16::from_le_bytes([raw[i * 4 + 2], raw[i * 4 + 3]]);
        }
        buf.send_buffer();
    }
}
