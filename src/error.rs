//! Crate-wide error type, composed from the leaf error enums used across
//! the GATT, L2CAP and raw-HCI layers.

use thiserror::Error;

/// Errors surfaced by a single [`crate::characteristic::Characteristic`] call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CharacteristicError {
    #[error("characteristic is not connected")]
    NotConnected,
    #[error("I/O error talking to bluetoothd: {0}")]
    IoError(String),
    #[error("reply had an unexpected shape or length")]
    InvalidReply,
    #[error("GATT call timed out")]
    Timeout,
}

/// Errors from [`crate::raw_hci::RawHci`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("no matching outgoing LE connection found for this peer")]
    NoMatchingConnection,
    #[error("failed to open raw HCI socket: {0}")]
    SocketError(String),
    #[error("operation requires CAP_NET_RAW")]
    CapabilityDenied,
    #[error("controller returned status {0:#04x}")]
    ControllerError(u8),
    #[error("timed out waiting for a controller reply")]
    Timeout,
}

/// Crate-wide error kinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Bluetooth is unavailable: {0}")]
    BluetoothUnavailable(String),
    #[error("peer is gone")]
    PeerGone,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport is full, frame dropped")]
    TransportFull,
    #[error("raw HCI capability denied: {0}")]
    CapabilityDenied(#[from] HciError),
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Characteristic(#[from] CharacteristicError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<bluer::Error> for Error {
    fn from(err: bluer::Error) -> Self {
        Error::BluetoothUnavailable(err.to_string())
    }
}

impl From<bluer::Error> for CharacteristicError {
    fn from(err: bluer::Error) -> Self {
        use bluer::ErrorKind as K;
        match err.kind {
            K::NotReady | K::ServicesUnresolved => CharacteristicError::NotConnected,
            K::Failed | K::NotFound | K::InvalidArguments | K::InvalidLength => {
                CharacteristicError::InvalidReply
            }
            _ => CharacteristicError::IoError(err.to_string()),
        }
    }
}

impl From<std::io::Error> for CharacteristicError {
    fn from(err: std::io::Error) -> Self {
        CharacteristicError::IoError(err.to_string())
    }
}
