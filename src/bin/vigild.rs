//! vigild - Vigil recording daemon
//!
//! This daemon:
//! 1. Starts the capture producer filling the frame ring
//! 2. Arms the recording orchestrator against the configured destinations
//! 3. Waits for trigger signals (or an explicit record request)
//! 4. Sweeps expired recording days on a retention schedule
//!
//! The synthetic capture device stands in for real camera hardware; a real
//! deployment implements `CaptureDevice` and `TriggerSource` against its
//! encoder and motion detector and wires them in here.

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vigil::orchestrator::OrchestratorConfig;
use vigil::{
    open_store, storage, Destination, FrameIndexedBuffer, MonitorControl, RecipientPublicKey,
    RecordingOrchestrator, StubTrigger, SyntheticCamera, SyntheticCameraConfig, VigilConfig,
};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Parser)]
#[command(name = "vigild", about = "Unattended motion-triggered recorder")]
struct Cli {
    /// Start with monitoring disabled (arm later via the control surface).
    #[arg(long)]
    idle: bool,

    /// Open a recording window immediately after arming.
    #[arg(long)]
    record_on_start: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let cfg = VigilConfig::load()?;

    let buffer = Arc::new(FrameIndexedBuffer::new(cfg.buffer.capacity_bytes)?);
    let camera = SyntheticCamera::start(buffer.clone(), SyntheticCameraConfig::default())?;

    let mut destinations = vec![Destination::Disk {
        root: cfg.recordings_root.clone(),
    }];
    if let Some(remote) = &cfg.remote {
        match open_store(&remote.url, &remote.token, remote.timeout) {
            Ok(store) => {
                let recipient = match &remote.public_key_path {
                    Some(path) => Some(RecipientPublicKey::from_hex_file(path)?),
                    None => None,
                };
                log::info!(
                    "remote destination {} ({}encrypted)",
                    remote.url,
                    if recipient.is_some() { "" } else { "un" }
                );
                destinations.push(Destination::Remote {
                    store,
                    settings: remote.clone(),
                    recipient,
                });
            }
            // The local destination still records if the remote one
            // cannot even be constructed.
            Err(err) => log::error!("remote destination disabled: {err:#}"),
        }
    }

    let control = MonitorControl::new(!cli.idle);
    if cli.record_on_start {
        control.request_recording();
    }

    let orchestrator = RecordingOrchestrator::new(
        OrchestratorConfig {
            camera_name: cfg.camera_name.clone(),
            day_format: cfg.day_format.clone(),
            time_format: cfg.time_format.clone(),
            container: cfg.container.clone(),
            preroll: cfg.preroll,
            quiet_period: cfg.quiet_period,
            max_event_duration: cfg.max_event_duration,
            warmup: cfg.warmup,
            intervals: cfg.intervals.clone(),
            bulk_read_threshold: cfg.buffer.bulk_read_threshold,
        },
        buffer,
        Box::new(camera.still_capture()),
        Box::new(StubTrigger::quiet()),
        destinations,
        control,
    )?;
    let handle = orchestrator.spawn();
    log::info!(
        "vigild running. camera={} recordings={}",
        cfg.camera_name,
        cfg.recordings_root.display()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_shutdown.store(true, Ordering::SeqCst);
    })?;

    let mut last_sweep: Option<Instant> = None;
    while !shutdown.load(Ordering::SeqCst) {
        if last_sweep.map_or(true, |at| at.elapsed() >= RETENTION_SWEEP_INTERVAL) {
            last_sweep = Some(Instant::now());
            match storage::enforce_retention(
                &cfg.recordings_root,
                cfg.retention,
                &cfg.day_format,
                chrono::Local::now(),
            ) {
                Ok(0) => {}
                Ok(removed) => log::info!("retention sweep removed {} day(s)", removed),
                Err(err) => log::error!("retention sweep failed: {err:#}"),
            }
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    log::info!("shutting down");
    handle.stop()?;
    camera.stop();
    Ok(())
}
