//! Conference Node
//!
//! Joins a two-party conference over UDP and streams a test tone to the peer,
//! pulling the peer's audio back through the mixer.
//!
//! ```text
//! conference-node <local-id> <bind-addr> <peer-id> <peer-ip> <send-port> <receive-port> [config.toml]
//! ```

use anyhow::{bail, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mixminus_dataplane::{
    audio::TimeIndex,
    conference::{Conference, PeerPorts},
    config::DataPlaneConfig,
    network::{FramingMode, TransportRegistry, UdpBackend},
};

/// Blocks between stats lines and cache resets
const REPORT_INTERVAL_BLOCKS: u64 = 500;

/// Mixed history kept behind the playhead, in host blocks
const CACHE_BLOCKS: TimeIndex = 64;

struct Args {
    local_id: u32,
    bind: SocketAddr,
    peer_id: u32,
    peer_ip: IpAddr,
    send_port: u16,
    receive_port: u16,
    config_path: Option<String>,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 6 {
        bail!("usage: conference-node <local-id> <bind-addr> <peer-id> <peer-ip> <send-port> <receive-port> [config.toml]");
    }
    Ok(Args {
        local_id: args[0].parse().context("Invalid local id")?,
        bind: args[1].parse().context("Invalid bind address")?,
        peer_id: args[2].parse().context("Invalid peer id")?,
        peer_ip: args[3].parse().context("Invalid peer address")?,
        send_port: args[4].parse().context("Invalid send port")?,
        receive_port: args[5].parse().context("Invalid receive port")?,
        config_path: args.get(6).cloned(),
    })
}

fn load_config(path: Option<&str>) -> Result<DataPlaneConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path))?;
            Ok(DataPlaneConfig::from_toml_str(&text)?)
        }
        None => Ok(DataPlaneConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let config = load_config(args.config_path.as_deref())?;

    tracing::info!(
        "Starting conference node {} ({} Hz, {} ch, codec block {}, host block {})",
        args.local_id,
        config.sample_rate,
        config.channels,
        config.block_size,
        config.host_block_size
    );

    let framing = if config.max_transport_unit < 1500 {
        FramingMode::Chunked { participant: args.local_id }
    } else {
        FramingMode::Single
    };
    let backend = UdpBackend::new(args.peer_ip, config.max_transport_unit, framing);
    let registry = Arc::new(TransportRegistry::new(backend));

    let conference = Conference::new(config.clone(), args.local_id, registry, args.bind)?;
    conference.add_peer(
        args.peer_id,
        PeerPorts {
            send_base: args.send_port,
            receive_base: args.receive_port,
        },
    )?;

    let host_block = config.host_block_size;
    let channels = config.channels as usize;
    let period = Duration::from_secs_f64(host_block as f64 / config.sample_rate as f64);
    let mut ticker = tokio::time::interval(period);

    let mut input = vec![0.0f32; host_block * channels];
    let mut output = vec![0.0f32; host_block * channels];
    let mut time: TimeIndex = 0;
    let mut blocks: u64 = 0;
    let step = 2.0 * std::f32::consts::PI * 440.0 / config.sample_rate as f32;

    tracing::info!("Streaming test tone - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        for (frame, samples) in input.chunks_exact_mut(channels).enumerate() {
            let phase = (time + frame as TimeIndex) as f32 * step;
            samples.fill(phase.sin() * 0.2);
        }

        if let Err(e) = conference.push_host_audio(time, &input) {
            tracing::warn!("Failed to push host audio: {}", e);
        }
        conference.pump_inbound();
        if let Err(e) = conference.render_host_audio(time, &mut output) {
            tracing::warn!("Failed to render playback: {}", e);
        }

        time += host_block as TimeIndex;
        blocks += 1;

        if blocks % REPORT_INTERVAL_BLOCKS == 0 {
            conference.reset_cache(time - CACHE_BLOCKS * host_block as TimeIndex);
            let stats = conference.stats();
            let peak = output.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
            tracing::info!(
                "Stats: {} blocks mixed, {} frames sent, {} received, {} decode failures, {} stale, {} send failures, playback peak {:.3}",
                stats.blocks_mixed,
                stats.frames_sent,
                stats.frames_received,
                stats.decode_failures,
                stats.stale_frames,
                stats.send_failures,
                peak
            );
        }
    }

    conference.remove_peer(args.peer_id);
    Ok(())
}
