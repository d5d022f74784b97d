//! Registers an object tree with the Bluetooth daemon to receive proximity
//! (RSSI) callbacks and trigger auto-(re)pair.
//!
//! `bluer::monitor` gives first-class support for BlueZ's
//! `AdvertisementMonitorManager1`, so registration itself is a single typed
//! call; the RSSI-threshold decision logic below is this module's own
//! contribution on top of that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bluer::monitor::{Monitor, MonitorType, Pattern};
use bluer::{Adapter, Address};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::side::ASHA_SERVICE_UUID;

/// AD type 0x03: Complete List of 16-bit Service Class UUIDs.
const AD_TYPE_16BIT_SERVICE_UUIDS: u8 = 0x03;
/// ASHA's 16-bit service UUID (0xFDF0), little-endian on the wire.
const ASHA_16BIT_UUID_LE: [u8; 2] = [0xF0, 0xFD];

/// Devices currently under RSSI watch, so `DeviceLost` can cancel the
/// per-device task instead of leaking it.
struct Tracked {
    watcher: tokio::task::JoinHandle<()>,
}

struct Thresholds {
    rssi_paired: i16,
    rssi_unpaired: i16,
}

/// Registers one `AdvertisementMonitor1` with the daemon and reacts to
/// RSSI updates on matching devices for the lifetime of this value.
/// Dropping it unregisters the monitor and stops the reaction task.
pub struct AdvertisementMonitor {
    worker: tokio::task::JoinHandle<()>,
    thresholds: std::sync::Arc<Mutex<Thresholds>>,
}

impl AdvertisementMonitor {
    pub async fn register(adapter: Adapter, rssi_paired: i16, rssi_unpaired: i16) -> bluer::Result<Self> {
        let manager = adapter.monitor().await?;
        let monitor = Monitor {
            monitor_type: MonitorType::OrPatterns,
            rssi_low_threshold: Some(-90),
            rssi_high_threshold: Some(-70),
            rssi_low_timeout: Some(5),
            rssi_high_timeout: Some(5),
            rssi_sampling_period: Some(0),
            patterns: Some(vec![Pattern {
                start_position: 0,
                ad_data_type: AD_TYPE_16BIT_SERVICE_UUIDS,
                content: ASHA_16BIT_UUID_LE.to_vec(),
            }]),
            ..Default::default()
        };
        let mut handle = manager.register(monitor).await?;
        info!("registered ASHA advertisement monitor with bluetoothd");

        let thresholds = Arc::new(Mutex::new(Thresholds {
            rssi_paired,
            rssi_unpaired,
        }));
        let thresholds2 = Arc::clone(&thresholds);
        let worker_adapter = adapter.clone();

        let worker = tokio::spawn(async move {
            let mut tracked: HashMap<Address, Tracked> = HashMap::new();
            while let Some(event) = handle.next().await {
                if let Err(e) =
                    handle_event(&worker_adapter, event, &mut tracked, &thresholds2).await
                {
                    warn!(error = %e, "error handling advertisement monitor event");
                }
            }
        });

        Ok(AdvertisementMonitor { worker, thresholds })
    }

    /// RSSI thresholds are the one piece of live-mutable configuration;
    /// the component that owns them exposes setters rather than requiring
    /// a full config reload.
    pub fn set_rssi_paired(&self, v: i16) {
        self.thresholds.lock().unwrap().rssi_paired = v;
    }

    pub fn set_rssi_unpaired(&self, v: i16) {
        self.thresholds.lock().unwrap().rssi_unpaired = v;
    }
}

impl Drop for AdvertisementMonitor {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn handle_event(
    adapter: &Adapter,
    event: bluer::monitor::MonitorEvent,
    tracked: &mut HashMap<Address, Tracked>,
    thresholds: &Arc<Mutex<Thresholds>>,
) -> bluer::Result<()> {
    match event {
        bluer::monitor::MonitorEvent::DeviceFound(addr) => on_device_found(adapter, addr, tracked, thresholds).await,
        bluer::monitor::MonitorEvent::DeviceLost(addr) => {
            if let Some(tracked) = tracked.remove(&addr) {
                tracked.watcher.abort();
            }
            Ok(())
        }
    }
}

/// Re-read `UUIDs`, ignore if the ASHA service isn't present (another
/// monitor's pattern may have matched instead), otherwise start watching
/// this device's `RSSI`/`Connected` property changes.
async fn on_device_found(
    adapter: &Adapter,
    addr: Address,
    tracked: &mut HashMap<Address, Tracked>,
    thresholds: &Arc<Mutex<Thresholds>>,
) -> bluer::Result<()> {
    let device = adapter.device(addr)?;
    let Some(uuids) = device.uuids().await? else {
        return Ok(());
    };
    let asha_uuid: bluer::Uuid = ASHA_SERVICE_UUID.parse().expect("static UUID is well-formed");
    if !uuids.contains(&asha_uuid) {
        debug!(%addr, "advertisement matched pattern but UUIDs don't confirm ASHA, ignoring");
        return Ok(());
    }

    let watcher_adapter = adapter.clone();
    let watcher_thresholds = Arc::clone(thresholds);
    let watcher = tokio::spawn(watch_device(watcher_adapter, addr, device, watcher_thresholds));
    tracked.insert(addr, Tracked { watcher });
    Ok(())
}

async fn watch_device(adapter: Adapter, addr: Address, device: bluer::Device, thresholds: Arc<Mutex<Thresholds>>) {
    let Ok(mut events) = device.events().await else {
        return;
    };
    while let Some(event) = events.next().await {
        if let bluer::DeviceEvent::PropertyChanged(bluer::DeviceProperty::Rssi(rssi)) = event {
            if let Err(e) = on_rssi_update(&adapter, &device, rssi, &thresholds).await {
                warn!(%addr, error = %e, "failed reacting to RSSI update");
            }
        }
    }
}

/// Strict `>` against the threshold that matches whether the peer is
/// already paired; a value equal to the threshold does not trigger. A
/// zero threshold disables the check for that category entirely. Calls
/// `Connect` on a paired device and `Pair` on an unpaired one.
async fn on_rssi_update(
    adapter: &Adapter,
    device: &bluer::Device,
    rssi: i16,
    thresholds: &Mutex<Thresholds>,
) -> bluer::Result<()> {
    let _ = adapter;
    if device.is_connected().await? {
        return Ok(());
    }

    let paired = device.is_paired().await?;
    let (threshold, disabled) = {
        let t = thresholds.lock().unwrap();
        if paired {
            (t.rssi_paired, t.rssi_paired == 0)
        } else {
            (t.rssi_unpaired, t.rssi_unpaired == 0)
        }
    };
    if disabled || rssi <= threshold {
        return Ok(());
    }

    info!(addr = %device.address(), rssi, paired, "RSSI threshold crossed, attempting connect");
    if paired {
        device.connect().await
    } else {
        device.pair().await
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn asha_16bit_uuid_pattern_matches_the_registered_service_uuid() {
        assert_eq!(super::ASHA_16BIT_UUID_LE, [0xF0, 0xFD]);
    }
}
