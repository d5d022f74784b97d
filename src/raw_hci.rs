//! Raw HCI socket for the commands BlueZ's normal socket API won't issue:
//! LE Set PHY, LE Set Data Length, LE Connection Update.
//!
//! A raw `AF_BLUETOOTH, SOCK_RAW, BTPROTO_HCI` socket is bound to whichever
//! adapter currently holds an outgoing LE connection to the peer MAC (found
//! via `HCIGETDEVLIST` + `HCIGETCONNLIST`), then vendor-neutral HCI commands
//! are sent directly and correlated to replies by connection handle.
//!
//! This bypasses `bluer`/BlueZ entirely because the kernel's HCI socket
//! layer is the only way to reach these commands; `bluer::l2cap` is used
//! everywhere else in this crate (see `src/side.rs`) but has no equivalent
//! surface here.

use std::mem::size_of;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::HciError;

const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;
const HCI_MAX_DEV: usize = 16;
const MAX_CONN: usize = 10;

const HCIGETDEVLIST: libc::c_ulong = 0x800448d2;
const HCIGETCONNLIST: libc::c_ulong = 0x800448d4;

const HCI_UP: u32 = 0; // bit 0 of dev_req.dev_opt

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

const EVT_CMD_COMPLETE: u8 = 0x0e;
const EVT_CMD_STATUS: u8 = 0x0f;
const EVT_LE_META_EVENT: u8 = 0x3e;

const LE_SET_PHY_SUBEVENT: u8 = 0x0c;
const LE_CONN_UPDATE_SUBEVENT: u8 = 0x03;

const OGF_LE_CONTROLLER: u8 = 0x08;
const OCF_LE_SET_DATA_LEN: u16 = 0x0022;
const OCF_LE_CONN_UPDATE: u16 = 0x0013;
const OCF_LE_SET_PHY: u16 = 0x0032;

const HCI_EVENT_TIMEOUT: Duration = Duration::from_secs(2);
const HCI_EVENT_RETRIES: usize = 5;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HciConnInfo {
    handle: u16,
    bdaddr: [u8; 6],
    link_type: u8,
    out: u8,
    state: u16,
    link_mode: u32,
}

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    // Stored reversed: b[5] is the first octet of the textual address.
    for (i, part) in parts.iter().enumerate() {
        out[5 - i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

/// Correlates the current outgoing LE connection to `mac` and issues raw HCI
/// tuning commands against it. Failure anywhere here is non-fatal to the
/// caller: the stream still works at default parameters, just with
/// potentially worse quality.
pub struct RawHci {
    sock: RawFd,
    device_id: u16,
    connection_id: u16,
}

impl RawHci {
    /// Opens the raw socket and finds the connection handle for `mac`.
    /// Returns `Err(HciError::NoMatchingConnection)` if none is found, which
    /// the caller should treat as "no tuning possible, continue anyway".
    pub fn open(mac: &str) -> Result<Self, HciError> {
        let mac_bytes = parse_mac(mac).ok_or(HciError::NoMatchingConnection)?;

        // SAFETY: straightforward raw-socket syscalls with owned fds, no
        // aliasing; checked immediately for -1.
        let sock = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_HCI) };
        if sock < 0 {
            return Err(HciError::SocketError(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        let (device_id, connection_id) = match Self::find_connection(sock, &mac_bytes) {
            Some(found) => found,
            None => {
                unsafe { libc::close(sock) };
                return Err(HciError::NoMatchingConnection);
            }
        };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: device_id,
            hci_channel: 0,
        };
        let rc = unsafe {
            libc::bind(
                sock,
                &addr as *const SockaddrHci as *const libc::sockaddr,
                size_of::<SockaddrHci>() as u32,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(sock) };
            if err.raw_os_error() == Some(libc::EPERM) || err.raw_os_error() == Some(libc::EACCES) {
                return Err(HciError::CapabilityDenied);
            }
            return Err(HciError::SocketError(err.to_string()));
        }

        Self::install_filter(sock);

        Ok(RawHci {
            sock,
            device_id,
            connection_id,
        })
    }

    /// Scan every HCI device's outgoing LE connections for `mac`, keeping
    /// the highest matching connection handle on the assumption it's the
    /// newest: there is no other signal for which HCI connection belongs to
    /// which L2CAP socket.
    fn find_connection(sock: RawFd, mac: &[u8; 6]) -> Option<(u16, u16)> {
        let mut dev_buf = vec![0u8; 4 + HCI_MAX_DEV * size_of::<HciDevReq>()];
        dev_buf[0..2].copy_from_slice(&(HCI_MAX_DEV as u16).to_ne_bytes());
        let rc = unsafe { libc::ioctl(sock, HCIGETDEVLIST, dev_buf.as_mut_ptr()) };
        if rc < 0 {
            return None;
        }
        let dev_num = u16::from_ne_bytes([dev_buf[0], dev_buf[1]]) as usize;

        let mut best: Option<(u16, u16)> = None;
        for i in 0..dev_num.min(HCI_MAX_DEV) {
            let off = 4 + i * size_of::<HciDevReq>();
            let dev_id = u16::from_ne_bytes([dev_buf[off], dev_buf[off + 1]]);
            let dev_opt = u32::from_ne_bytes(dev_buf[off + 4..off + 8].try_into().unwrap());
            if dev_opt & (1 << HCI_UP) == 0 {
                continue;
            }

            let mut conn_buf = vec![0u8; 4 + MAX_CONN * size_of::<HciConnInfo>()];
            conn_buf[0..2].copy_from_slice(&dev_id.to_ne_bytes());
            conn_buf[2..4].copy_from_slice(&(MAX_CONN as u16).to_ne_bytes());
            if unsafe { libc::ioctl(sock, HCIGETCONNLIST, conn_buf.as_mut_ptr()) } != 0 {
                continue;
            }
            let conn_num = u16::from_ne_bytes([conn_buf[2], conn_buf[3]]) as usize;
            for j in 0..conn_num.min(MAX_CONN) {
                let off = 4 + j * size_of::<HciConnInfo>();
                let handle = u16::from_ne_bytes([conn_buf[off], conn_buf[off + 1]]);
                let bdaddr: [u8; 6] = conn_buf[off + 2..off + 8].try_into().unwrap();
                let out = conn_buf[off + 9];
                if out == 0 {
                    continue;
                }
                if &bdaddr == mac {
                    let better = match best {
                        Some((_, prev_handle)) => handle > prev_handle,
                        None => true,
                    };
                    if better {
                        best = Some((dev_id, handle));
                    }
                }
            }
        }
        best
    }

    fn install_filter(sock: RawFd) {
        // type_mask bit HCI_EVENT_PKT, event_mask bits for the three events
        // we poll for. Best-effort: a broken filter just means we see more
        // traffic than necessary.
        let mut filter = [0u8; 16];
        filter[0..4].copy_from_slice(&(1u32 << HCI_EVENT_PKT).to_ne_bytes());
        let mut event_mask: u64 = 0;
        event_mask |= 1 << EVT_CMD_STATUS;
        event_mask |= 1 << EVT_CMD_COMPLETE;
        event_mask |= 1 << EVT_LE_META_EVENT;
        filter[4..12].copy_from_slice(&event_mask.to_ne_bytes());
        let rc = unsafe {
            libc::setsockopt(
                sock,
                SOL_HCI,
                HCI_FILTER,
                filter.as_ptr() as *const libc::c_void,
                filter.len() as u32,
            )
        };
        if rc < 0 {
            debug!("failed to install hci filter, continuing unfiltered");
        }
    }

    fn opcode(ogf: u8, ocf: u16) -> u16 {
        ((ogf as u16) << 10) | (ocf & 0x03ff)
    }

    /// Send a command and poll for the matching command-status /
    /// command-complete / LE-meta-event reply, succeeding only when the
    /// reply's connection handle equals ours.
    fn send_command(
        &self,
        ocf: u16,
        params: &[u8],
        meta_sub_event: Option<u8>,
    ) -> Result<Vec<u8>, HciError> {
        let opcode = Self::opcode(OGF_LE_CONTROLLER, ocf);
        let mut msg = Vec::with_capacity(4 + params.len());
        msg.push(HCI_COMMAND_PKT);
        msg.extend_from_slice(&opcode.to_le_bytes());
        msg.push(params.len() as u8);
        msg.extend_from_slice(params);

        loop {
            let rc = unsafe { libc::send(self.sock, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
            if rc >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                Some(libc::EPERM) => return Err(HciError::CapabilityDenied),
                _ => return Err(HciError::SocketError(err.to_string())),
            }
        }

        for _ in 0..HCI_EVENT_RETRIES {
            let mut pfd = libc::pollfd {
                fd: self.sock,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, HCI_EVENT_TIMEOUT.as_millis() as i32) };
            if rc == 0 {
                return Err(HciError::Timeout);
            }
            if rc < 0 {
                return Err(HciError::SocketError(std::io::Error::last_os_error().to_string()));
            }

            let mut buf = [0u8; 260];
            let len = unsafe { libc::read(self.sock, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if len < 0 {
                return Err(HciError::SocketError(std::io::Error::last_os_error().to_string()));
            }
            let len = len as usize;
            if len < 3 || buf[0] != HCI_EVENT_PKT {
                continue;
            }
            let evt = buf[1];
            let plen = buf[2] as usize;
            if len < 3 + plen {
                continue;
            }
            let params = &buf[3..3 + plen];

            match evt {
                e if e == EVT_CMD_STATUS && params.len() >= 4 => {
                    let status = params[0];
                    let opc = u16::from_le_bytes([params[2], params[3]]);
                    if opc == opcode {
                        if status != 0 {
                            return Err(HciError::ControllerError(status));
                        }
                        // Pending, keep waiting for command-complete/meta-event.
                    }
                }
                e if e == EVT_CMD_COMPLETE && params.len() >= 3 => {
                    let opc = u16::from_le_bytes([params[1], params[2]]);
                    if opc == opcode {
                        let rest = &params[3..];
                        if rest.len() < 3 {
                            return Err(HciError::SocketError("truncated reply".into()));
                        }
                        let handle = u16::from_le_bytes([rest[1], rest[2]]);
                        if handle == self.connection_id {
                            return Ok(rest.to_vec());
                        }
                        // Somebody else's response; keep waiting.
                    }
                }
                e if e == EVT_LE_META_EVENT && !params.is_empty() && meta_sub_event == Some(params[0]) => {
                    let rest = &params[1..];
                    if rest.len() < 3 {
                        return Err(HciError::SocketError("truncated reply".into()));
                    }
                    let handle = u16::from_le_bytes([rest[1], rest[2]]);
                    if handle == self.connection_id {
                        return Ok(rest.to_vec());
                    }
                }
                _ => {}
            }
        }
        Err(HciError::Timeout)
    }

    /// LE Set PHY: request LE 2M on both TX and RX.
    pub fn set_phy_2m(&self) -> Result<(), HciError> {
        let params = [0u8, 0x02, 0x02, 0x00, 0x00];
        let reply = self.send_command(OCF_LE_SET_PHY, &params, Some(LE_SET_PHY_SUBEVENT))?;
        if reply.first() == Some(&0) {
            Ok(())
        } else {
            Err(HciError::ControllerError(reply.first().copied().unwrap_or(0xff)))
        }
    }

    /// LE Set Data Length: request `tx_octets` bytes with `tx_time` µs.
    pub fn set_data_length(&self, tx_octets: u16, tx_time: u16) -> Result<(), HciError> {
        let mut params = Vec::with_capacity(4);
        params.extend_from_slice(&tx_octets.to_le_bytes());
        params.extend_from_slice(&tx_time.to_le_bytes());
        let reply = self.send_command(OCF_LE_SET_DATA_LEN, &params, None)?;
        if reply.first() == Some(&0) {
            Ok(())
        } else {
            Err(HciError::ControllerError(reply.first().copied().unwrap_or(0xff)))
        }
    }

    /// LE Connection Update: min/max interval (x1.25ms), latency (events),
    /// supervision timeout (x10ms), and optional CE length window
    /// (x0.625ms).
    pub fn set_connection_parameters(
        &self,
        min_interval: u16,
        max_interval: u16,
        latency: u16,
        timeout: u16,
        min_ce: u16,
        max_ce: u16,
    ) -> Result<(), HciError> {
        let mut params = Vec::with_capacity(12);
        for v in [min_interval, max_interval, latency, timeout, min_ce, max_ce] {
            params.extend_from_slice(&v.to_le_bytes());
        }
        let reply = self.send_command(OCF_LE_CONN_UPDATE, &params, Some(LE_CONN_UPDATE_SUBEVENT))?;
        if reply.first() == Some(&0) {
            Ok(())
        } else {
            Err(HciError::ControllerError(reply.first().copied().unwrap_or(0xff)))
        }
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn connection_id(&self) -> u16 {
        self.connection_id
    }
}

impl Drop for RawHci {
    fn drop(&mut self) {
        unsafe { libc::close(self.sock) };
    }
}

/// Runs every RawHci tuning step for a newly-connected side, logging and
/// continuing on any failure.
pub fn tune_connection(mac: &str, phy1m: bool, phy2m: bool, interval: u16, timeout: u16, celength: u16) {
    let hci = match RawHci::open(mac) {
        Ok(hci) => hci,
        Err(e) => {
            warn!(%mac, error = %e, "could not correlate an HCI connection for raw tuning");
            return;
        }
    };

    match hci.set_connection_parameters(interval, interval, 0, timeout, 0, celength) {
        Ok(()) => debug!(%mac, interval, timeout, "set connection parameters"),
        Err(e) => warn!(%mac, error = %e, "failed to set connection parameters"),
    }

    if phy2m {
        match hci.set_phy_2m() {
            Ok(()) => debug!(%mac, "set 2M PHY"),
            Err(e) => warn!(%mac, error = %e, "unable to set 2M PHY"),
        }
    }
    let _ = phy1m; // 1M is the link default; nothing to request explicitly.

    // 161 data bytes plus a 6-byte header, comfortably inside one 10ms PDU
    // window at 16kHz per side.
    match hci.set_data_length(167, 9000) {
        Ok(()) => debug!(%mac, "set data length to 167 bytes"),
        Err(e) => debug!(%mac, error = %e, "failed to set data length"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac_into_reversed_bytes() {
        let mac = parse_mac("9C:9C:1D:98:BE:82").unwrap();
        assert_eq!(mac, [0x82, 0xbe, 0x98, 0x1d, 0x9c, 0x9c]);
    }

    #[test]
    fn rejects_malformed_mac() {
        assert!(parse_mac("not-a-mac").is_none());
    }

    #[test]
    fn opcode_packs_ogf_and_ocf() {
        // LE Set PHY: OGF 0x08, OCF 0x0032 => opcode 0x2032
        assert_eq!(RawHci::opcode(0x08, 0x0032), 0x2032);
    }
}
