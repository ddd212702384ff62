use anyhow::{Context, Result};
use rollcall_core::{AttendanceRecorder, Gallery, SessionWindow, SharedGallery};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{Bus, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::load()?;
    config.log_summary();

    let manifest = config.model_manifest()?;
    manifest.verify().context("model verification failed")?;

    let store = Store::open(&config.db_path).await?;

    let gallery = SharedGallery::new(Gallery::new(config.gallery_config()));
    {
        let entries = store.load_gallery().await?;
        let mut g = gallery.write();
        for entry in entries {
            g.restore(entry);
        }
        tracing::info!(people = g.len(), references = g.reference_count(), "gallery restored");
    }

    // Attendance already persisted today must not be re-emitted after a restart
    let today = SessionWindow::daily_local(u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0));
    let (mut recorder, mut attendance_rx) = AttendanceRecorder::channel();
    let recorded: Vec<_> = store
        .events_in_window(&today)
        .await?
        .into_iter()
        .map(|e| e.person_id)
        .collect();
    tracing::info!(window = %today, recorded = recorded.len(), "attendance state restored");
    recorder.restore(&today, recorded);

    let (engine, mut health_rx) = engine::spawn_engine(&config, &manifest, gallery.clone(), recorder)?;

    let service = RollcallService::new(engine.clone(), gallery, store.clone(), config.metric);
    let builder = match config.bus {
        Bus::System => zbus::connection::Builder::system()?,
        Bus::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    let iface = conn
        .object_server()
        .interface::<_, RollcallService>(OBJECT_PATH)
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    loop {
        tokio::select! {
            Some(event) = attendance_rx.recv() => {
                match store.record_event(&event).await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!(person = %event.person_id, "attendance already persisted"),
                    Err(e) => tracing::error!(error = %e, person = %event.person_id, "failed to persist attendance"),
                }
                if let Err(e) = RollcallService::attendance_recorded(
                    iface.signal_emitter(),
                    event.person_id.as_str(),
                    event.window.as_str(),
                    event.timestamp_ms,
                )
                .await
                {
                    tracing::warn!(error = %e, "failed to emit AttendanceRecorded");
                }
            }
            Some(health) = health_rx.recv() => {
                if let Err(e) = RollcallService::health_changed(iface.signal_emitter(), &health.to_string()).await {
                    tracing::warn!(error = %e, "failed to emit HealthChanged");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("rollcalld shutting down");
    engine.shutdown();
    tokio::task::spawn_blocking(move || engine.join()).await?;
    Ok(())
}
