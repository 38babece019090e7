use anyhow::Context;
use ble_link::domain::error::LinkResult;
use ble_link::domain::models::LinkEvent;
use ble_link::domain::settings::SettingsService;
use ble_link::infrastructure::bluetooth::{
    self, permissions::AlwaysGranted, BluetoothService, LinkHandle, LinkOptions,
};
use ble_link::infrastructure::logging;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Events go to stdout, one JSON object per line
fn print_event(event: &LinkEvent) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

fn join_worker(worker: JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("Bluetooth thread panicked"))?
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let settings_service = match std::env::args_os().nth(1) {
        Some(path) => SettingsService::load_from(path),
        None => SettingsService::new()?,
    };

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting BLE link");
    if !settings_service.path().exists() {
        match settings_service.save() {
            Ok(()) => info!("Wrote default settings to {}", settings_service.path().display()),
            Err(e) => warn!("Could not write default settings: {}", e),
        }
    }

    let link = settings_service.get().link.clone();
    let options = LinkOptions::from(&link);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let (handle_tx, handle_rx) = oneshot::channel::<LinkResult<LinkHandle>>();

    // The link owns its own runtime so platform callbacks never wait on stdout
    let worker = std::thread::spawn(move || -> anyhow::Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create tokio runtime for Bluetooth")?;

        rt.block_on(async move {
            let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
            let adapter = match bluetooth::platform_adapter(adapter_tx).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    let _ = handle_tx.send(Err(e));
                    return;
                }
            };

            let (service, handle) = BluetoothService::new(
                adapter,
                adapter_rx,
                Box::new(AlwaysGranted),
                event_tx,
                options,
            );
            if handle_tx.send(Ok(handle)).is_ok() {
                service.run().await;
            }
        });
        Ok(())
    });

    let handle = match handle_rx.await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            error!("Bluetooth unavailable: {}", e);
            print_event(&e.clone().into_event())?;
            join_worker(worker)?;
            return Err(e.into());
        }
        Err(_) => {
            join_worker(worker)?;
            anyhow::bail!("Bluetooth thread exited before starting");
        }
    };

    if !link.has_target() {
        warn!(
            "No target_name or target_address in {}, connecting to the first device found",
            settings_service.path().display()
        );
    }
    match (&link.target_name, &link.target_address) {
        (None, Some(address)) => handle.connect_address(address.clone()),
        _ => handle.start_scan(link.scan_filter(), link.scan_duration()),
    };

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => print_event(&event)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    handle.shutdown();
    drop(handle);
    while let Some(event) = event_rx.recv().await {
        print_event(&event)?;
    }

    join_worker(worker)?;
    info!("BLE link stopped");
    Ok(())
}
