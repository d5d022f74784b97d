//! Registers the ASHA service UUID with the Bluetooth daemon so it
//! auto-reconnects known peripherals.
//!
//! A bare `org.bluez.GattProfile1` object (no characteristics, just a
//! `UUIDs` property) registered via `GattManager1.RegisterApplication` is
//! enough for BlueZ to keep reconnecting a paired device exposing that
//! service. `bluer::gatt::local::Application` implements that D-Bus surface
//! directly, so serving one `Service` with no characteristics gets the
//! same effect without hand-marshaling `GattManager1` ourselves.

use bluer::gatt::local::{Application, ApplicationHandle, Service};
use bluer::Adapter;
use tracing::info;

use crate::side::ASHA_SERVICE_UUID;

/// Holds the registration alive; dropping it unregisters the application.
pub struct GattProfile {
    _handle: ApplicationHandle,
}

impl GattProfile {
    pub async fn register(adapter: &Adapter) -> bluer::Result<Self> {
        let uuid: bluer::Uuid = ASHA_SERVICE_UUID.parse().expect("static UUID is well-formed");
        let app = Application {
            services: vec![Service {
                uuid,
                primary: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let handle = adapter.serve_gatt_application(app).await?;
        info!("registered ASHA GATT profile for auto-reconnect");
        Ok(GattProfile { _handle: handle })
    }
}
