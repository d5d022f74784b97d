//! Typed wrapper around a single remote GATT characteristic: read,
//! write-request, write-command, and subscribe/unsubscribe, built on
//! `bluer::gatt::remote::Characteristic`. Subscription teardown is
//! guaranteed on drop so a dropped handle never leaves a dangling
//! notification task behind.

use std::time::Duration;

use bluer::gatt::{remote::Characteristic as BluerCharacteristic, CharacteristicWriteRequest, WriteOp};
use bluer::Uuid;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::CharacteristicError;

/// GATT calls that would hang forever on a peer that never answers expire
/// after this long and surface as [`CharacteristicError::Timeout`].
pub const GATT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A single remote GATT characteristic plus its (at most one) active
/// notification subscription.
pub struct Characteristic {
    inner: BluerCharacteristic,
    uuid: Uuid,
    notify_task: Option<JoinHandle<()>>,
}

impl Characteristic {
    pub fn new(inner: BluerCharacteristic, uuid: Uuid) -> Self {
        Characteristic {
            inner,
            uuid,
            notify_task: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn with_timeout<T>(
        fut: impl std::future::Future<Output = bluer::Result<T>>,
    ) -> Result<T, CharacteristicError> {
        match tokio::time::timeout(GATT_CALL_TIMEOUT, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CharacteristicError::Timeout),
        }
    }

    /// Read the characteristic's current value.
    pub async fn read(&self) -> Result<Vec<u8>, CharacteristicError> {
        Self::with_timeout(self.inner.read()).await
    }

    /// Write and wait for the peer's acknowledgement (GATT Write Request).
    pub async fn write_request(&self, bytes: &[u8]) -> Result<(), CharacteristicError> {
        let req = CharacteristicWriteRequest {
            op_type: WriteOp::Request,
            ..Default::default()
        };
        Self::with_timeout(self.inner.write_ext(bytes, &req)).await
    }

    /// Fire-and-forget write (GATT Write Command); no acknowledgement is
    /// awaited.
    pub async fn write_command(&self, bytes: &[u8]) -> Result<(), CharacteristicError> {
        let req = CharacteristicWriteRequest {
            op_type: WriteOp::Command,
            ..Default::default()
        };
        Self::with_timeout(self.inner.write_ext(bytes, &req)).await
    }

    /// Subscribe to notifications. A second call replaces the previous
    /// subscription idempotently; the previous background task is aborted
    /// first.
    pub async fn subscribe<F>(&mut self, mut on_notify: F) -> Result<(), CharacteristicError>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        self.unsubscribe();

        let mut stream = Self::with_timeout(self.inner.notify()).await?;
        let handle = tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                on_notify(value);
            }
            debug!("characteristic notification stream ended");
        });
        self.notify_task = Some(handle);
        Ok(())
    }

    /// Cancel the active subscription, if any. Guaranteed to run on drop.
    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.notify_task.take() {
            handle.abort();
        }
    }
}

impl Drop for Characteristic {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("subscribed", &self.notify_task.is_some())
            .finish()
    }
}
