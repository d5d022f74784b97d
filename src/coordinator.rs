//! Process-wide singleton wiring the enumerator to `Device`/`Side` creation,
//! serialising mutations through a task queue so map mutations never race
//! in-flight GATT replies.
//!
//! A [`tokio::sync::mpsc`] channel drained by a single consumer task gives
//! that serialization for free: tasks posted from the enumerator are
//! processed one at a time, in FIFO order, on `spawn()`'s background task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::device::{Device, Frame};
use crate::side::Side;

enum Task {
    AddSide { path: String, side: Side },
    RemoveSide { path: String },
}

/// Handle used by the enumerator (and anything else) to post mutations.
/// Cheap to clone; every clone shares the same underlying queue.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tasks: mpsc::UnboundedSender<Task>,
}

impl CoordinatorHandle {
    /// A newly-admitted side appeared.
    pub fn add_side(&self, path: String, side: Side) {
        let _ = self.tasks.send(Task::AddSide { path, side });
    }

    /// A side's peripheral disappeared.
    pub fn remove_side(&self, path: String) {
        let _ = self.tasks.send(Task::RemoveSide { path });
    }
}

/// `map<hi_sync_id, Device>` plus the deferred task queue.
pub struct Coordinator {
    devices: RwLock<HashMap<u64, Arc<Device>>>,
    /// `path -> hi_sync_id`, so `remove_side` (which only knows the path)
    /// can find which device to ask without scanning every device.
    side_owner: RwLock<HashMap<String, u64>>,
}

impl Coordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Coordinator {
            devices: RwLock::new(HashMap::new()),
            side_owner: RwLock::new(HashMap::new()),
        })
    }

    /// Spawns the single task that owns all device-map mutations and
    /// returns a cheap handle for posting work to it, guaranteeing FIFO
    /// ordering of mutations regardless of how many callers hold a handle.
    pub fn spawn(self: &Arc<Self>) -> CoordinatorHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                this.process(task).await;
            }
        });
        CoordinatorHandle { tasks: tx }
    }

    async fn process(&self, task: Task) {
        match task {
            Task::AddSide { path, side } => self.handle_add_side(path, side).await,
            Task::RemoveSide { path } => self.handle_remove_side(path).await,
        }
    }

    async fn handle_add_side(&self, path: String, side: Side) {
        let hi_sync_id = side.hi_sync_id();
        let device = {
            let mut devices = self.devices.write().await;
            Arc::clone(devices.entry(hi_sync_id).or_insert_with(|| {
                info!(hi_sync_id = format_args!("{hi_sync_id:#018x}"), "adding device");
                Arc::new(Device::new(hi_sync_id, side.name().to_string(), side.alias().to_string()))
            }))
        };
        self.side_owner.write().await.insert(path.clone(), hi_sync_id);
        device.add_side(path, side).await;
    }

    async fn handle_remove_side(&self, path: String) {
        let Some(hi_sync_id) = self.side_owner.write().await.remove(&path) else {
            return;
        };
        let device = {
            let devices = self.devices.read().await;
            devices.get(&hi_sync_id).cloned()
        };
        let Some(device) = device else { return };

        device.remove_side(&path).await;
        if device.side_count().await == 0 {
            info!(hi_sync_id = format_args!("{hi_sync_id:#018x}"), "removing device");
            self.devices.write().await.remove(&hi_sync_id);
        }
    }

    /// Fan out one 20ms PCM frame to every known device. Returns true if at
    /// least one device accepted it; this is the function a
    /// [`crate::buffer::Buffer`] ultimately calls back into.
    pub async fn send_audio(&self, frame: &Frame) -> bool {
        let devices: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        let mut any = false;
        for device in devices {
            if device.send_audio(frame).await {
                any = true;
            }
        }
        any
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{CAPABILITY_RIGHT_SIDE, CODEC_G722_16KHZ, FEATURE_STREAMING};

    // `Side` can't be constructed outside the crate without a live GATT
    // connection; device/coordinator wiring is instead covered indirectly
    // through `crate::device`'s own mock-backed tests. This module only
    // checks the parts that don't require a `Side`.
    #[tokio::test]
    async fn starts_with_no_devices() {
        let coordinator = Coordinator::new();
        assert_eq!(coordinator.device_count().await, 0);
    }

    #[test]
    fn properties_bit_constants_combine_into_expected_byte_values() {
        // capabilities=0x03 (right side + binaural), feature_map=0x01, codecs=0x02.
        assert_eq!(CAPABILITY_RIGHT_SIDE | 0x02, 0x03);
        assert_eq!(FEATURE_STREAMING, 0x01);
        assert_eq!(CODEC_G722_16KHZ, 0x02);
    }
}
