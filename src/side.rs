//! One hearing device: characteristics, L2CAP socket, state machine.
//!
//! Connection bring-up follows a fixed sequence: bind an L2CAP CoC socket
//! in `BT_MODE=LE_FLOWCTL`, connect it, subscribe to status notifications,
//! then issue best-effort `RawHci` tuning.

use std::sync::{Arc, Mutex};

use bluer::gatt::remote::Characteristic as BluerCharacteristic;
use bluer::l2cap::{FlowControl, Socket, SocketAddr as L2capSocketAddr};
use bluer::{Address, AddressType};
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::characteristic::{Characteristic, GATT_CALL_TIMEOUT};
use crate::error::CharacteristicError;
use crate::properties::ReadOnlyProperties;
use crate::raw_hci;

pub const ASHA_SERVICE_UUID: &str = "0000fdf0-0000-1000-8000-00805f9b34fb";
pub const ASHA_READ_ONLY_PROPERTIES: &str = "6333651e-c481-4a3e-9169-7c902aad37bb";
pub const ASHA_AUDIO_CONTROL_POINT: &str = "f0d4de7e-4a88-476c-9d9f-1937b0996cc0";
pub const ASHA_AUDIO_STATUS: &str = "38663f1a-e711-4cac-b641-326b56404837";
pub const ASHA_VOLUME: &str = "00e4ca9e-ab14-41e4-8823-f9e70c7e91df";
pub const ASHA_LE_PSM_OUT: &str = "2d410339-82b6-42aa-b34e-e2e01df8cc1a";

mod control {
    pub const START: u8 = 1;
    pub const STOP: u8 = 2;
    pub const STATUS: u8 = 3;
}

mod update {
    pub const OTHER_DISCONNECTED: u8 = 0;
    pub const OTHER_CONNECTED: u8 = 1;
    pub const PARAMETERS_UPDATED: u8 = 2;
}

const G722_16KHZ: u8 = 1;

/// Side state machine. Transitions are driven by [`crate::device::Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Connecting,
    WaitingForReady,
    Ready,
    WaitingForStop,
}

/// Result of [`Side::write_audio_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ok,
    WouldBlock,
    Disconnected,
    NotReady,
    Truncated,
    Oversized,
}

/// Status byte carried by the `AudioStatus` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusByte {
    Ok,
    UnknownCommand,
    IllegalParameter,
    Other(i8),
}

impl From<i8> for StatusByte {
    fn from(v: i8) -> Self {
        match v {
            0 => StatusByte::Ok,
            -1 => StatusByte::UnknownCommand,
            -2 => StatusByte::IllegalParameter,
            other => StatusByte::Other(other),
        }
    }
}

/// Object-safe surface of [`Side`] that [`crate::device::Device`] drives.
/// Exists so `Device`'s state machine can be unit tested against
/// [`mock::MockSide`] without a live GATT/L2CAP connection.
///
/// Trait methods delegate to `Side`'s own inherent methods of the same
/// name; Rust resolves `self.foo()` to the inherent impl first, so there is
/// no infinite recursion between the two.
#[async_trait::async_trait]
pub trait SideOps: Send {
    fn is_ready(&self) -> bool;
    fn is_right(&self) -> bool;
    fn is_left(&self) -> bool;
    fn writable(&self) -> bool;
    fn write_audio_frame(&mut self, payload: &[u8; 160], seq: u8) -> WriteStatus;
    async fn start(&mut self, other_side_present: bool) -> Result<StatusByte, CharacteristicError>;
    async fn stop(&mut self) -> Result<StatusByte, CharacteristicError>;
    fn set_stream_volume(&mut self, v: i8);
    async fn set_external_volume(&self, v: i8) -> Result<(), CharacteristicError>;
    fn description(&self) -> String;
    fn hi_sync_id(&self) -> u64;
}

#[async_trait::async_trait]
impl SideOps for Side {
    fn is_ready(&self) -> bool {
        self.is_ready()
    }
    fn is_right(&self) -> bool {
        self.is_right()
    }
    fn is_left(&self) -> bool {
        self.is_left()
    }
    fn writable(&self) -> bool {
        self.writable()
    }
    fn write_audio_frame(&mut self, payload: &[u8; 160], seq: u8) -> WriteStatus {
        self.write_audio_frame(payload, seq)
    }
    async fn start(&mut self, other_side_present: bool) -> Result<StatusByte, CharacteristicError> {
        self.start(other_side_present).await
    }
    async fn stop(&mut self) -> Result<StatusByte, CharacteristicError> {
        self.stop().await
    }
    fn set_stream_volume(&mut self, v: i8) {
        self.set_stream_volume(v)
    }
    async fn set_external_volume(&self, v: i8) -> Result<(), CharacteristicError> {
        self.set_external_volume(v).await
    }
    fn description(&self) -> String {
        self.description()
    }
    fn hi_sync_id(&self) -> u64 {
        self.hi_sync_id()
    }
}

/// Test-only [`SideOps`] fake standing in for a GATT-connected `Side`.
/// `start`/`stop` resolve immediately instead of waiting for a real
/// `AudioStatus` notification. Call counts and recorded audio frames are
/// exposed through a cloneable [`mock::MockSideHandle`] kept by the test
/// after the `MockSide` itself is moved into a `Device`.
#[cfg(test)]
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{CharacteristicError, SideOps, State, StatusByte, WriteStatus};

    struct Inner {
        is_right: bool,
        hi_sync_id: u64,
        state: Mutex<State>,
        start_result: Mutex<StatusByte>,
        stop_result: Mutex<StatusByte>,
        writable: AtomicBool,
        disconnect_on_write: AtomicBool,
        volume: Mutex<i8>,
        frames: Mutex<Vec<(u8, [u8; 160])>>,
        start_calls: Mutex<Vec<bool>>,
        stop_calls: AtomicUsize,
    }

    pub struct MockSide(Arc<Inner>);

    #[derive(Clone)]
    pub struct MockSideHandle(Arc<Inner>);

    impl MockSide {
        /// Builds a mock side plus the handle used to inspect it after it's
        /// handed to `Device::add_side`.
        pub fn new(is_right: bool, hi_sync_id: u64) -> (Self, MockSideHandle) {
            let inner = Arc::new(Inner {
                is_right,
                hi_sync_id,
                state: Mutex::new(State::Stopped),
                start_result: Mutex::new(StatusByte::Ok),
                stop_result: Mutex::new(StatusByte::Ok),
                writable: AtomicBool::new(true),
                disconnect_on_write: AtomicBool::new(false),
                volume: Mutex::new(0),
                frames: Mutex::new(Vec::new()),
                start_calls: Mutex::new(Vec::new()),
                stop_calls: AtomicUsize::new(0),
            });
            (MockSide(Arc::clone(&inner)), MockSideHandle(inner))
        }
    }

    impl MockSideHandle {
        pub fn start_calls(&self) -> Vec<bool> {
            self.0.start_calls.lock().unwrap().clone()
        }
        pub fn stop_count(&self) -> usize {
            self.0.stop_calls.load(Ordering::Relaxed)
        }
        pub fn frames(&self) -> Vec<(u8, [u8; 160])> {
            self.0.frames.lock().unwrap().clone()
        }
        pub fn volume(&self) -> i8 {
            *self.0.volume.lock().unwrap()
        }
        pub fn set_writable(&self, writable: bool) {
            self.0.writable.store(writable, Ordering::Relaxed);
        }
        pub fn set_start_result(&self, status: StatusByte) {
            *self.0.start_result.lock().unwrap() = status;
        }
        pub fn force_disconnect(&self) {
            *self.0.state.lock().unwrap() = State::Stopped;
        }
        /// Keeps the mock `Ready` but makes its next `write_audio_frame`
        /// report `Disconnected`, as a real socket would on peer dropout.
        pub fn disconnect_on_next_write(&self) {
            self.0.disconnect_on_write.store(true, Ordering::Relaxed);
        }
    }

    #[async_trait::async_trait]
    impl SideOps for MockSide {
        fn is_ready(&self) -> bool {
            *self.0.state.lock().unwrap() == State::Ready
        }
        fn is_right(&self) -> bool {
            self.0.is_right
        }
        fn is_left(&self) -> bool {
            !self.0.is_right
        }
        fn writable(&self) -> bool {
            self.0.writable.load(Ordering::Relaxed)
        }
        fn write_audio_frame(&mut self, payload: &[u8; 160], seq: u8) -> WriteStatus {
            if !self.is_ready() {
                return WriteStatus::NotReady;
            }
            if self.0.disconnect_on_write.swap(false, Ordering::Relaxed) {
                *self.0.state.lock().unwrap() = State::Stopped;
                return WriteStatus::Disconnected;
            }
            self.0.frames.lock().unwrap().push((seq, *payload));
            WriteStatus::Ok
        }
        async fn start(&mut self, other_side_present: bool) -> Result<StatusByte, CharacteristicError> {
            self.0.start_calls.lock().unwrap().push(other_side_present);
            let status = *self.0.start_result.lock().unwrap();
            *self.0.state.lock().unwrap() = if status == StatusByte::Ok {
                State::Ready
            } else {
                State::Stopped
            };
            Ok(status)
        }
        async fn stop(&mut self) -> Result<StatusByte, CharacteristicError> {
            self.0.stop_calls.fetch_add(1, Ordering::Relaxed);
            *self.0.state.lock().unwrap() = State::Stopped;
            Ok(*self.0.stop_result.lock().unwrap())
        }
        fn set_stream_volume(&mut self, v: i8) {
            *self.0.volume.lock().unwrap() = v;
        }
        async fn set_external_volume(&self, v: i8) -> Result<(), CharacteristicError> {
            *self.0.volume.lock().unwrap() = v;
            Ok(())
        }
        fn description(&self) -> String {
            format!("MockSide({})", if self.0.is_right { "R" } else { "L" })
        }
        fn hi_sync_id(&self) -> u64 {
            self.0.hi_sync_id
        }
    }
}

struct Characteristics {
    properties: Characteristic,
    audio_control: Characteristic,
    status: Characteristic,
    volume: Option<Characteristic>,
    le_psm_out: Characteristic,
}

/// One physical hearing device.
pub struct Side {
    mac: String,
    name: String,
    alias: String,
    properties: ReadOnlyProperties,
    chars: Characteristics,

    psm: u16,
    socket: Option<bluer::l2cap::SeqPacket>,
    volume: i8,
    state: State,

    /// Armed by `start()`/`stop()` while awaiting the `AudioStatus`
    /// notification that completes the pending request; fulfilled by the
    /// notification closure installed in `enable_status_notifications`.
    /// A notification that arrives with nothing armed is discarded.
    pending_status: Arc<Mutex<Option<oneshot::Sender<StatusByte>>>>,
}

/// Raw material gathered by the enumerator before a `Side` is admitted.
pub struct Candidate {
    pub mac: String,
    pub name: String,
    pub alias: String,
    pub properties_char: BluerCharacteristic,
    pub audio_control_char: BluerCharacteristic,
    pub status_char: BluerCharacteristic,
    pub volume_char: Option<BluerCharacteristic>,
    pub le_psm_out_char: BluerCharacteristic,
}

impl Side {
    /// Read `ReadOnlyProperties` and admit the candidate only if it passes
    /// the support invariant (`version == 1`, streaming feature bit,
    /// G.722@16kHz codec bit).
    pub async fn create_if_valid(candidate: Candidate, default_volume: i8) -> Option<Side> {
        let uuid = |s: &str| s.parse().expect("static ASHA UUIDs are well-formed");
        let properties = Characteristic::new(candidate.properties_char, uuid(ASHA_READ_ONLY_PROPERTIES));
        let audio_control = Characteristic::new(candidate.audio_control_char, uuid(ASHA_AUDIO_CONTROL_POINT));
        let status = Characteristic::new(candidate.status_char, uuid(ASHA_AUDIO_STATUS));
        let volume = candidate
            .volume_char
            .map(|c| Characteristic::new(c, uuid(ASHA_VOLUME)));
        let le_psm_out = Characteristic::new(candidate.le_psm_out_char, uuid(ASHA_LE_PSM_OUT));

        let raw = match properties.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(mac = %candidate.mac, error = %e, "failed to read ReadOnlyProperties");
                return None;
            }
        };
        let parsed = match ReadOnlyProperties::parse(&raw) {
            Some(p) => p,
            None => {
                warn!(mac = %candidate.mac, len = raw.len(), "ReadOnlyProperties reply too short");
                return None;
            }
        };
        if !parsed.is_supported() {
            debug!(mac = %candidate.mac, ?parsed, "side does not meet ASHA feature requirements, ignoring");
            return None;
        }

        Some(Side {
            mac: candidate.mac,
            name: candidate.name,
            alias: candidate.alias,
            properties: parsed,
            chars: Characteristics {
                properties,
                audio_control,
                status,
                volume,
                le_psm_out,
            },
            psm: 0,
            socket: None,
            volume: default_volume,
            state: State::Stopped,
            pending_status: Arc::new(Mutex::new(None)),
        })
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn properties(&self) -> &ReadOnlyProperties {
        &self.properties
    }

    pub fn hi_sync_id(&self) -> u64 {
        self.properties.hi_sync_id
    }

    pub fn is_right(&self) -> bool {
        self.properties.is_right()
    }

    pub fn is_left(&self) -> bool {
        !self.is_right()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// `"{name} (Left)"` / `"{name} (Right)"` for binaural pairs, else just
    /// `name`.
    pub fn description(&self) -> String {
        if self.properties.is_binaural() {
            if self.properties.is_right() {
                format!("{} (Right)", self.name)
            } else {
                format!("{} (Left)", self.name)
            }
        } else {
            self.name.clone()
        }
    }

    /// Bring up the L2CAP CoC socket and issue best-effort RawHci tuning.
    /// Subscribes to status notifications on success.
    pub async fn connect(
        &mut self,
        phy1m: bool,
        phy2m: bool,
        interval: u16,
        timeout: u16,
        celength: u16,
    ) -> Result<(), CharacteristicError> {
        self.state = State::Connecting;

        let psm_bytes = self.chars.le_psm_out.read().await?;
        if psm_bytes.len() < 2 {
            return Err(CharacteristicError::InvalidReply);
        }
        self.psm = u16::from_le_bytes([psm_bytes[0], psm_bytes[1]]);

        let addr: Address = self
            .mac
            .parse()
            .map_err(|_| CharacteristicError::InvalidReply)?;

        let socket = Socket::new_seq_packet().map_err(CharacteristicError::from)?;
        socket
            .bind(L2capSocketAddr::any_le())
            .map_err(CharacteristicError::from)?;
        socket
            .set_flow_control(FlowControl::Le)
            .map_err(CharacteristicError::from)?;
        let peer = L2capSocketAddr::new(addr, AddressType::LePublic, self.psm);
        let conn = socket.connect(peer).await.map_err(CharacteristicError::from)?;
        self.socket = Some(conn);

        self.enable_status_notifications().await?;

        // Best-effort; never fails the connection.
        let mac = self.mac.clone();
        tokio::task::spawn_blocking(move || {
            raw_hci::tune_connection(&mac, phy1m, phy2m, interval, timeout, celength)
        });

        Ok(())
    }

    async fn enable_status_notifications(&mut self) -> Result<(), CharacteristicError> {
        let pending = Arc::clone(&self.pending_status);
        self.chars
            .status
            .subscribe(move |bytes| {
                let Some(&raw) = bytes.first() else {
                    warn!("empty AudioStatus notification, ignoring");
                    return;
                };
                let status = StatusByte::from(raw as i8);
                match pending.lock().unwrap().take() {
                    Some(tx) => {
                        let _ = tx.send(status);
                    }
                    None => debug!(?status, "AudioStatus notification with no pending request, discarding"),
                }
            })
            .await
    }

    pub fn disconnect(&mut self) {
        self.socket = None;
        self.state = State::Stopped;
        self.chars.status.unsubscribe();
        // Any request still in flight can never complete now.
        self.pending_status.lock().unwrap().take();
    }

    /// Arm a fresh one-shot for the next `AudioStatus` notification,
    /// replacing (and thereby abandoning) any request still pending.
    fn arm_pending(&self) -> oneshot::Receiver<StatusByte> {
        let (tx, rx) = oneshot::channel();
        *self.pending_status.lock().unwrap() = Some(tx);
        rx
    }

    async fn await_status(&self, rx: oneshot::Receiver<StatusByte>) -> Result<StatusByte, CharacteristicError> {
        match tokio::time::timeout(GATT_CALL_TIMEOUT, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(CharacteristicError::NotConnected),
            Err(_) => Err(CharacteristicError::Timeout),
        }
    }

    /// Write `AudioControlPoint` START (opcode 1) and await the matching
    /// `AudioStatus` notification.
    pub async fn start(&mut self, other_side_present: bool) -> Result<StatusByte, CharacteristicError> {
        self.state = State::WaitingForReady;
        let rx = self.arm_pending();
        let payload = [
            control::START,
            G722_16KHZ,
            0, // audio type: unknown
            self.volume as u8,
            other_side_present as u8,
        ];
        if let Err(e) = self.chars.audio_control.write_request(&payload).await {
            self.state = State::Stopped;
            return Err(e);
        }
        let status = self.await_status(rx).await?;
        self.state = if status == StatusByte::Ok { State::Ready } else { State::Stopped };
        Ok(status)
    }

    /// Write `AudioControlPoint` STOP (opcode 2) and await its acknowledging
    /// notification. The side is considered stopped either way once the
    /// round trip completes.
    pub async fn stop(&mut self) -> Result<StatusByte, CharacteristicError> {
        self.state = State::WaitingForStop;
        let rx = self.arm_pending();
        let result = self.chars.audio_control.write_request(&[control::STOP]).await;
        self.state = State::Stopped;
        result?;
        self.await_status(rx).await
    }

    /// Fire-and-forget STATUS sub-opcode notifying this side that its
    /// partner's connection state changed, so an already-READY side stays
    /// informed when its partner (dis)connects.
    pub async fn update_other_connected(&self, connected: bool) -> Result<(), CharacteristicError> {
        let sub = if connected {
            update::OTHER_CONNECTED
        } else {
            update::OTHER_DISCONNECTED
        };
        self.chars
            .audio_control
            .write_command(&[control::STATUS, sub])
            .await
    }

    /// Fire-and-forget STATUS sub-opcode notifying this side of a
    /// renegotiated connection interval.
    pub async fn update_connection_parameters(&self, interval: u8) -> Result<(), CharacteristicError> {
        self.chars
            .audio_control
            .write_command(&[control::STATUS, update::PARAMETERS_UPDATED, interval])
            .await
    }

    /// Stream-relative volume: stored, applied on the next `start()`.
    pub fn set_stream_volume(&mut self, v: i8) {
        self.volume = v;
    }

    /// Absolute volume sent immediately via the optional Volume
    /// characteristic. No-op if this side doesn't expose one.
    pub async fn set_external_volume(&self, v: i8) -> Result<(), CharacteristicError> {
        if let Some(volume_char) = &self.chars.volume {
            volume_char.write_command(&[v as u8]).await
        } else {
            Ok(())
        }
    }

    /// Non-blocking SDU send of `[seq, 160 bytes g722]`. The sequence byte
    /// itself is owned and advanced by `Device`, shared across both sides
    /// of a pair; only the audio thread touches the socket.
    pub fn write_audio_frame(&mut self, payload: &[u8; 160], seq: u8) -> WriteStatus {
        if self.state != State::Ready {
            return WriteStatus::NotReady;
        }
        let Some(socket) = &self.socket else {
            return WriteStatus::NotReady;
        };

        let mut packet = [0u8; 161];
        packet[0] = seq;
        packet[1..].copy_from_slice(payload);

        match socket.send(&packet).now_or_never() {
            Some(Ok(n)) if n == packet.len() => WriteStatus::Ok,
            Some(Ok(n)) if n < packet.len() => WriteStatus::Truncated,
            Some(Ok(_)) => WriteStatus::Oversized,
            Some(Err(e)) => {
                warn!(mac = %self.mac, error = %e, "disconnected writing audio frame");
                self.socket = None;
                self.state = State::Stopped;
                WriteStatus::Disconnected
            }
            None => WriteStatus::WouldBlock,
        }
    }

    /// Non-blocking POLLOUT probe (timeout 0) used by `Device::send_audio`'s
    /// poll-all-sides-before-encoding step. A real `poll()` syscall rather
    /// than a zero-length `send`, since probing by sending would put an
    /// empty SDU on the wire.
    pub fn writable(&self) -> bool {
        use std::os::fd::AsRawFd;
        let Some(socket) = &self.socket else {
            return false;
        };
        let mut pfd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc > 0 && (pfd.revents & libc::POLLOUT) != 0
    }
}

impl std::fmt::Debug for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Side")
            .field("mac", &self.mac)
            .field("state", &self.state)
            .field("hi_sync_id", &format_args!("{:#018x}", self.properties.hi_sync_id))
            .finish()
    }
}
