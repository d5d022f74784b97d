//! Subscribes to the system Bluetooth daemon's object-manager tree and
//! emits add/remove events for candidate peripherals.
//!
//! `bluer::Adapter::discover_devices` gives a live event stream that folds
//! the daemon's initial object enumeration and its `InterfacesAdded`/
//! `InterfacesRemoved` signals into a single `Stream`, so there's no need
//! to separately walk `ObjectManager.GetManagedObjects` at startup.

use bluer::{Adapter, AdapterEvent, Address};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::coordinator::CoordinatorHandle;
use crate::side::{self, Candidate};

const ASHA_SERVICE_UUID: &str = side::ASHA_SERVICE_UUID;

/// L2CAP/RawHci tuning parameters plumbed through to every admitted side's
/// `connect()` call.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams {
    pub phy1m: bool,
    pub phy2m: bool,
    pub interval: u16,
    pub timeout: u16,
    pub celength: u16,
}

/// Runs until the adapter's discovery stream ends (normally: never, until
/// the process shuts down). Spawns one task per candidate device so a slow
/// GATT resolution on one peripheral never blocks discovery of another.
pub async fn run(
    adapter: Adapter,
    handle: CoordinatorHandle,
    left_volume: i8,
    right_volume: i8,
    connect: ConnectParams,
) -> bluer::Result<()> {
    let mut events = adapter.discover_devices().await?;
    info!("scanning for ASHA peripherals");

    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(addr) => {
                let adapter = adapter.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    match try_admit(&adapter, addr, &handle, left_volume, right_volume, connect).await {
                        Ok(true) => {}
                        Ok(false) => debug!(%addr, "device is not an ASHA peripheral, ignoring"),
                        Err(e) => warn!(%addr, error = %e, "failed to admit candidate device"),
                    }
                });
            }
            AdapterEvent::DeviceRemoved(addr) => {
                handle.remove_side(addr.to_string());
            }
            AdapterEvent::PropertyChanged(_) => {}
        }
    }
    Ok(())
}

/// We key sides by MAC address string rather than a D-Bus object path:
/// `bluer`'s typed API hands out `Address`/`Device` values, not the raw
/// path BlueZ assigns, and the address is just as stable an identity for
/// the lifetime of a connection.
fn path_for(addr: Address) -> String {
    addr.to_string()
}

async fn try_admit(
    adapter: &Adapter,
    addr: Address,
    handle: &CoordinatorHandle,
    left_volume: i8,
    right_volume: i8,
    connect: ConnectParams,
) -> bluer::Result<bool> {
    let device = adapter.device(addr)?;

    let Some(uuids) = device.uuids().await? else {
        return Ok(false);
    };
    let asha_uuid: bluer::Uuid = ASHA_SERVICE_UUID.parse().expect("static UUID is well-formed");
    if !uuids.contains(&asha_uuid) {
        return Ok(false);
    }

    if !device.is_connected().await? {
        device.connect().await?;
    }
    wait_for_services_resolved(&device).await?;

    let Some(candidate) = gather_candidate(&device).await? else {
        return Ok(false);
    };

    // `create_if_valid` doesn't know handedness until it has parsed
    // `ReadOnlyProperties`, so seed it with the left default and correct it
    // below once we do.
    let Some(mut side) = side::Side::create_if_valid(candidate, left_volume).await else {
        return Ok(false);
    };
    if side.is_right() {
        side.set_stream_volume(right_volume);
    }

    if let Err(e) = side.connect(connect.phy1m, connect.phy2m, connect.interval, connect.timeout, connect.celength).await {
        warn!(%addr, error = %e, "L2CAP connect failed, not admitting side");
        return Ok(false);
    }

    info!(%addr, name = %side.name(), "admitted ASHA side");
    handle.add_side(path_for(addr), side);
    Ok(true)
}

async fn wait_for_services_resolved(device: &bluer::Device) -> bluer::Result<()> {
    use tokio::time::{timeout, Duration};
    if device.is_services_resolved().await.unwrap_or(false) {
        return Ok(());
    }
    let mut events = device.events().await?;
    let _ = timeout(Duration::from_secs(10), async {
        while let Some(evt) = events.next().await {
            if let bluer::DeviceEvent::PropertyChanged(bluer::DeviceProperty::ServicesResolved(true)) = evt {
                break;
            }
        }
    })
    .await;
    Ok(())
}

async fn gather_candidate(device: &bluer::Device) -> bluer::Result<Option<Candidate>> {
    let mac = device.address().to_string();
    let name = device.name().await?.unwrap_or_else(|| mac.clone());
    let alias = device.alias().await.unwrap_or_else(|_| name.clone());

    let mut properties_char = None;
    let mut audio_control_char = None;
    let mut status_char = None;
    let mut volume_char = None;
    let mut le_psm_out_char = None;

    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?.to_string();
            match uuid.as_str() {
                side::ASHA_READ_ONLY_PROPERTIES => properties_char = Some(characteristic),
                side::ASHA_AUDIO_CONTROL_POINT => audio_control_char = Some(characteristic),
                side::ASHA_AUDIO_STATUS => status_char = Some(characteristic),
                side::ASHA_VOLUME => volume_char = Some(characteristic),
                side::ASHA_LE_PSM_OUT => le_psm_out_char = Some(characteristic),
                _ => {}
            }
        }
    }

    let (Some(properties_char), Some(audio_control_char), Some(status_char), Some(le_psm_out_char)) =
        (properties_char, audio_control_char, status_char, le_psm_out_char)
    else {
        debug!(%mac, "device advertises the ASHA service but is missing a mandatory characteristic");
        return Ok(None);
    };

    Ok(Some(Candidate {
        mac,
        name,
        alias,
        properties_char,
        audio_control_char,
        status_char,
        volume_char,
        le_psm_out_char,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_the_mac_address_text() {
        let addr: Address = "9C:9C:1D:98:BE:82".parse().unwrap();
        assert_eq!(path_for(addr), "9C:9C:1D:98:BE:82");
    }
}
