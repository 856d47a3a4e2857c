//! mqnic simulator - runs the control plane against a loopback device

use mqnic_control::{
    Collaborators, ControlConfig, FlowKey, LoopbackDevice, MonotonicClock, NicControlPlane, Packet,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Synthetic flows cycled through by the traffic generator
const SIM_FLOWS: u16 = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("mqnic simulator v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::var("MQNIC_CONFIG") {
        Ok(path) => ControlConfig::load(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "Config not loaded, using defaults");
            ControlConfig::default()
        }),
        Err(_) => ControlConfig::default(),
    };
    let run_for = std::env::var("MQNIC_SIM_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);

    let device = Arc::new(LoopbackDevice::new(config.pool.buffers_per_node));
    let plane = Arc::new(NicControlPlane::new(
        config,
        Collaborators::loopback(device.clone()),
        Arc::new(MonotonicClock::new()),
    )?);
    plane.start_workers()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let timers = {
        let plane = plane.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { plane.run_timers(rx).await })
    };
    let traffic = {
        let plane = plane.clone();
        let device = device.clone();
        let rx = shutdown_rx;
        tokio::spawn(async move { generate_traffic(plane, device, rx).await })
    };

    match run_for {
        Some(duration) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = tokio::time::sleep(duration) => {},
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    tracing::info!("Shutting down");

    shutdown_tx.send(true)?;
    let _ = tokio::join!(timers, traffic);

    let report = plane.shutdown();
    tracing::info!(
        flows_dropped = report.flows_dropped,
        outstanding = report.buffers_outstanding,
        "Teardown complete"
    );
    println!("{}", plane.metrics().to_json()?);

    Ok(())
}

/// Transmit a packet per flow every millisecond, complete transmits and
/// echo a receive for every queue.
async fn generate_traffic(
    plane: Arc<NicControlPlane>,
    device: Arc<LoopbackDevice>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    let mut round: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let port = (round % SIM_FLOWS as u32) as u16;
        let key = FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 1).into(),
            Ipv4Addr::new(10, 0, 1, 1).into(),
            1024 + port,
            443,
            6,
        );
        let len = 64 + (round % 1400);
        if let Err(e) = plane.datapath().transmit(Packet::from_key(&key, len)) {
            tracing::debug!(error = %e, "Transmit dropped");
        }

        for queue_id in plane.registry().queue_ids() {
            device.complete_tx(queue_id);
            if round % 16 == 0 {
                if let Err(e) = plane.datapath().post_rx_buffers(queue_id, 1) {
                    tracing::debug!(queue = queue_id, error = %e, "Rx buffer not posted");
                }
                device.complete_rx(queue_id, key.flow_id(), len);
            }
        }
        round = round.wrapping_add(1);
    }
}
