//! A pair of hearing-aid sides sharing one sync-id: the pairing state
//! machine, G.722 encode, and audio fan-out.
//!
//! `Side::start`/`Side::stop` (see `side.rs`) already await their own status
//! notification, so `Device` just awaits them directly and applies the
//! resulting transition inline rather than threading callbacks through a
//! separate completion graph.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{self, Encoder};
use crate::error::CharacteristicError;
use crate::side::{SideOps, StatusByte};

/// One 20 ms block of linear 16-bit PCM at 16 kHz, stereo. The shared
/// currency between a `Buffer` and `Device::send_audio`.
#[derive(Clone, Copy)]
pub struct Frame {
    pub left: [i16; codec::FRAME_SAMPLES],
    pub right: [i16; codec::FRAME_SAMPLES],
}

impl Default for Frame {
    fn default() -> Self {
        Frame {
            left: [0; codec::FRAME_SAMPLES],
            right: [0; codec::FRAME_SAMPLES],
        }
    }
}

/// Device pairing/streaming state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    StreamInit,
    Streaming,
}

struct AudioState {
    sides: Vec<(String, Box<dyn SideOps>)>,
    encoder_left: Encoder,
    encoder_right: Encoder,
    audio_seq: u8,
}

/// A pair of hearing devices sharing one `hi_sync_id`.
///
/// `sides`, the encoder state, and `audio_seq` live behind one
/// [`tokio::sync::Mutex`] (`AudioState`): `send_audio` (audio task) and the
/// pairing operations below (control-loop task) both touch `sides`, and the
/// encoder/`audio_seq` naturally co-vary with it on every `send_audio` call.
/// `state` is read from the audio task without locking as a fast pre-check;
/// it is only ever written from the serialized control loop.
pub struct Device {
    hi_sync_id: u64,
    name: String,
    alias: String,
    state: std::sync::atomic::AtomicU8,
    audio: Mutex<AudioState>,
}

const STOPPED: u8 = 0;
const STREAM_INIT: u8 = 1;
const STREAMING: u8 = 2;

fn state_from_u8(v: u8) -> State {
    match v {
        STOPPED => State::Stopped,
        STREAM_INIT => State::StreamInit,
        _ => State::Streaming,
    }
}

impl Device {
    pub fn new(hi_sync_id: u64, name: String, alias: String) -> Self {
        Device {
            hi_sync_id,
            name,
            alias,
            state: std::sync::atomic::AtomicU8::new(STOPPED),
            audio: Mutex::new(AudioState {
                sides: Vec::new(),
                encoder_left: Encoder::new(),
                encoder_right: Encoder::new(),
                audio_seq: 0,
            }),
        }
    }

    pub fn hi_sync_id(&self) -> u64 {
        self.hi_sync_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn state(&self) -> State {
        state_from_u8(self.state.load(std::sync::atomic::Ordering::Relaxed))
    }

    fn set_state(&self, s: State) {
        let v = match s {
            State::Stopped => STOPPED,
            State::StreamInit => STREAM_INIT,
            State::Streaming => STREAMING,
        };
        self.state.store(v, std::sync::atomic::Ordering::Relaxed);
    }

    pub async fn side_count(&self) -> usize {
        self.audio.lock().await.sides.len()
    }

    /// Insert `side` under `path`, ask it to start, and drive the device's
    /// state transition.
    ///
    /// `STOPPED -> STREAM_INIT`; `STREAM_INIT -> STREAM_INIT`; `STREAMING
    /// -> STREAM_INIT` after first stopping and restarting every other
    /// currently-READY side (the peripherals require the "other side
    /// present" flag to be re-applied symmetrically). The joining side is
    /// inserted (but not started) before any of that happens, and only
    /// started once the other sides have finished restarting.
    pub async fn add_side<S: SideOps + 'static>(&self, path: String, side: S) {
        info!(device = %self.name, side = %side.description(), "adding side");

        let prior_state = self.state();
        let other_present_before = {
            let audio = self.audio.lock().await;
            !audio.sides.is_empty()
        };

        // Inserted before it's started (and before any other side is
        // restarted) so `all_sides_ready` can't see only the survivor and
        // begin streaming before this side has caught up.
        {
            let mut audio = self.audio.lock().await;
            audio.sides.push((path.clone(), Box::new(side)));
        }

        match prior_state {
            State::Stopped => self.set_state(State::StreamInit),
            State::StreamInit => {}
            State::Streaming => {
                self.set_state(State::StreamInit);
                // Adding a second side: once this returns there will be
                // exactly two, so the survivor always restarts with
                // other_side_present=true.
                self.restart_other_sides(&path, true).await;
            }
        }

        let start_result = {
            let mut audio = self.audio.lock().await;
            let Some((_, side)) = audio.sides.iter_mut().find(|(p, _)| p == &path) else {
                return;
            };
            side.start(other_present_before).await
        };
        self.on_started(start_result).await;
    }

    /// Stop and restart every side other than `except_path`, sequentially.
    ///
    /// `other_present` is the "other side present" flag to restart with.
    /// It can't be derived from the live side count here: when called from
    /// `add_side`, the joining side is already in the map (so its length is
    /// right) but not yet started, so `all_sides_ready` still requires it
    /// to catch up before any restarted side's completion can begin
    /// streaming. The caller passes the flag it already knows to be true
    /// once its own operation completes.
    async fn restart_other_sides(&self, except_path: &str, other_present: bool) {
        let paths: Vec<String> = {
            let audio = self.audio.lock().await;
            audio
                .sides
                .iter()
                .filter(|(p, _)| p != except_path)
                .map(|(p, _)| p.clone())
                .collect()
        };
        for path in paths {
            let stop_result = {
                let mut audio = self.audio.lock().await;
                let Some((_, side)) = audio.sides.iter_mut().find(|(p, _)| p == &path) else {
                    continue;
                };
                side.stop().await
            };
            if let Err(e) = stop_result {
                warn!(device = %self.name, %path, error = %e, "side stop failed during restart");
            }
            let start_result = {
                let mut audio = self.audio.lock().await;
                let Some((_, side)) = audio.sides.iter_mut().find(|(p, _)| p == &path) else {
                    continue;
                };
                side.start(other_present).await
            };
            self.on_started(start_result).await;
        }
    }

    /// Remove the side at `path`, reversing `add_side`'s transitions.
    pub async fn remove_side(&self, path: &str) -> bool {
        let removed = {
            let mut audio = self.audio.lock().await;
            let Some(idx) = audio.sides.iter().position(|(p, _)| p == path) else {
                return false;
            };
            audio.sides.remove(idx);
            true
        };
        if !removed {
            return false;
        }

        info!(device = %self.name, %path, "removing side");

        match self.state() {
            State::Stopped => {
                debug_assert!(false, "removed a side while already STOPPED");
                warn!(device = %self.name, "remove_side called in STOPPED state, ignoring");
            }
            State::StreamInit => {
                if self.side_count().await == 0 {
                    self.set_state(State::Stopped);
                } else if self.all_sides_ready().await {
                    self.begin_streaming().await;
                }
            }
            State::Streaming => {
                if self.side_count().await == 0 {
                    self.set_state(State::Stopped);
                } else {
                    self.set_state(State::StreamInit);
                    // A device holds at most two sides; one was just
                    // removed, so whatever's left is alone.
                    self.restart_other_sides("", false).await;
                }
            }
        }
        true
    }

    async fn all_sides_ready(&self) -> bool {
        let audio = self.audio.lock().await;
        !audio.sides.is_empty() && audio.sides.iter().all(|(_, s)| s.is_ready())
    }

    /// Reset encoder state and `audio_seq`, then move to STREAMING. Called
    /// once the last STREAM_INIT side reaches READY.
    async fn begin_streaming(&self) {
        let mut audio = self.audio.lock().await;
        audio.encoder_left = Encoder::new();
        audio.encoder_right = Encoder::new();
        audio.audio_seq = 0;
        drop(audio);
        self.set_state(State::Streaming);
    }

    /// Called with the result of a `side.start()` call. Moves the device
    /// to STREAMING once every side in the pair has reached READY.
    async fn on_started(&self, result: Result<StatusByte, CharacteristicError>) {
        match result {
            Ok(StatusByte::Ok) => {}
            Ok(other) => {
                warn!(device = %self.name, ?other, "side start rejected by peripheral");
                return;
            }
            Err(e) => {
                warn!(device = %self.name, error = %e, "side start failed");
                return;
            }
        }
        if self.state() == State::StreamInit && self.all_sides_ready().await {
            self.begin_streaming().await;
        }
    }

    /// Poll every side for writability, encode, and fan out one audio
    /// frame.
    ///
    /// Drops the frame (returning `false`) if the device isn't STREAMING,
    /// any side isn't READY, or any side's socket isn't currently
    /// writable. On success every side receives the same sequence byte
    /// and `audio_seq` advances exactly once. A side whose write comes
    /// back `Disconnected` is torn down the same way `remove_side` would:
    /// the device falls back to STREAM_INIT (or STOPPED if it was the
    /// last side) and any surviving side is restarted with the
    /// now-current "other side present" flag.
    pub async fn send_audio(&self, frame: &Frame) -> bool {
        if self.state() != State::Streaming {
            return false;
        }

        let (disconnected, any_ok) = {
            let mut audio = self.audio.lock().await;
            if audio.sides.is_empty() || !audio.sides.iter().all(|(_, s)| s.is_ready()) {
                return false;
            }
            if !audio.sides.iter().all(|(_, s)| s.writable()) {
                return false;
            }

            let (left_pcm, right_pcm, mono) = if audio.sides.len() == 1 {
                (None, None, Some(codec::mix_mono(&frame.left, &frame.right)))
            } else {
                (Some(frame.left), Some(frame.right), None)
            };

            let left_frame = match &mono {
                Some(m) => audio.encoder_left.encode(m),
                None => audio.encoder_left.encode(left_pcm.as_ref().unwrap()),
            };
            let right_frame = match &mono {
                Some(_) => left_frame,
                None => audio.encoder_right.encode(right_pcm.as_ref().unwrap()),
            };

            let seq = audio.audio_seq;
            let mut any_ok = false;
            let mut disconnected = Vec::new();
            for (path, side) in audio.sides.iter_mut() {
                let payload = if side.is_right() { &right_frame } else { &left_frame };
                match side.write_audio_frame(payload, seq) {
                    crate::side::WriteStatus::Ok => any_ok = true,
                    crate::side::WriteStatus::Disconnected => {
                        debug!(device = %self.name, %path, "write_audio_frame: disconnected");
                        disconnected.push(path.clone());
                    }
                    other => {
                        debug!(device = %self.name, %path, ?other, "write_audio_frame: non-fatal failure");
                    }
                }
            }
            if any_ok {
                audio.audio_seq = audio.audio_seq.wrapping_add(1);
            }
            (disconnected, any_ok)
        };

        for path in disconnected {
            self.remove_side(&path).await;
        }
        any_ok
    }

    /// Forward to every side matching `is_left`. Called from the audio
    /// thread.
    pub async fn set_stream_volume(&self, is_left: bool, v: i8) {
        let mut audio = self.audio.lock().await;
        for (_, side) in audio.sides.iter_mut() {
            if side.is_left() == is_left {
                side.set_stream_volume(v);
            }
        }
    }

    /// Forward to every side matching `is_left`. Called from the audio
    /// thread.
    pub async fn set_external_volume(&self, is_left: bool, v: i8) {
        let audio = self.audio.lock().await;
        for (_, side) in audio.sides.iter() {
            if side.is_left() == is_left {
                if let Err(e) = side.set_external_volume(v).await {
                    warn!(device = %self.name, error = %e, "set_external_volume failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("hi_sync_id", &format_args!("{:#018x}", self.hi_sync_id))
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side::mock::MockSide;

    const HI_SYNC_ID: u64 = 0x0102030405060708;

    fn frame_with(left: i16, right: i16) -> Frame {
        Frame {
            left: [left; codec::FRAME_SAMPLES],
            right: [right; codec::FRAME_SAMPLES],
        }
    }

    /// One side reaches STREAMING as soon as its (immediately-resolving,
    /// mocked) `start()` call succeeds.
    #[tokio::test]
    async fn single_side_reaches_streaming() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        let (side, handle) = MockSide::new(false, HI_SYNC_ID);

        device.add_side("left".into(), side).await;

        assert_eq!(device.state(), State::Streaming);
        assert_eq!(device.side_count().await, 1);
        assert_eq!(handle.start_calls(), vec![false]);
    }

    /// A second side of the same pair causes the first (already-READY)
    /// side to be stopped and restarted with
    /// `other_side_present=true`, and the device ends up STREAMING again
    /// with both sides.
    #[tokio::test]
    async fn second_side_restarts_the_first_with_other_present() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        let (left, left_handle) = MockSide::new(false, HI_SYNC_ID);
        let (right, right_handle) = MockSide::new(true, HI_SYNC_ID);

        device.add_side("left".into(), left).await;
        assert_eq!(left_handle.start_calls(), vec![false]);

        device.add_side("right".into(), right).await;

        assert_eq!(device.side_count().await, 2);
        assert_eq!(device.state(), State::Streaming);
        assert_eq!(left_handle.stop_count(), 1, "surviving side must be stopped once");
        assert_eq!(
            left_handle.start_calls(),
            vec![false, true],
            "surviving side restarts with other_side_present=true"
        );
        assert_eq!(right_handle.start_calls(), vec![true]);
    }

    /// Two sides streaming, one frame in → exactly one payload per side,
    /// identical sequence byte, `audio_seq` advances by exactly one.
    #[tokio::test]
    async fn two_sides_receive_matching_sequence_numbers() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        let (left, left_handle) = MockSide::new(false, HI_SYNC_ID);
        let (right, right_handle) = MockSide::new(true, HI_SYNC_ID);
        device.add_side("left".into(), left).await;
        device.add_side("right".into(), right).await;

        let delivered = device.send_audio(&frame_with(100, 300)).await;

        assert!(delivered);
        assert_eq!(left_handle.frames().len(), 1);
        assert_eq!(right_handle.frames().len(), 1);
        let (left_seq, _) = left_handle.frames()[0];
        let (right_seq, _) = right_handle.frames()[0];
        assert_eq!(left_seq, right_seq);

        let delivered_again = device.send_audio(&frame_with(100, 300)).await;
        assert!(delivered_again);
        let (next_seq, _) = left_handle.frames()[1];
        assert_eq!(next_seq, left_seq.wrapping_add(1));
    }

    /// With only one side present, left/right PCM is mixed to mono before
    /// encoding, and that single side gets the mixed payload.
    #[tokio::test]
    async fn single_side_gets_the_mono_mix() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        let (side, handle) = MockSide::new(false, HI_SYNC_ID);
        device.add_side("left".into(), side).await;

        let mut mono_encoder = Encoder::new();
        let mono_pcm = codec::mix_mono(&[100; codec::FRAME_SAMPLES], &[300; codec::FRAME_SAMPLES]);
        let expected_payload = mono_encoder.encode(&mono_pcm);

        assert!(device.send_audio(&frame_with(100, 300)).await);
        let (_, payload) = handle.frames()[0];
        assert_eq!(payload, expected_payload);
    }

    /// A frame sent while the device isn't STREAMING is dropped and does
    /// not touch `audio_seq`.
    #[tokio::test]
    async fn send_audio_before_streaming_is_dropped() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        assert_eq!(device.state(), State::Stopped);
        assert!(!device.send_audio(&frame_with(0, 0)).await);
    }

    /// A side that comes back `Disconnected` from `write_audio_frame` is
    /// torn down like `remove_side` would, and any surviving side is
    /// restarted with the now-current other-present flag.
    #[tokio::test]
    async fn disconnected_side_is_torn_down_and_survivor_restarts() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        let (left, left_handle) = MockSide::new(false, HI_SYNC_ID);
        let (right, right_handle) = MockSide::new(true, HI_SYNC_ID);
        device.add_side("left".into(), left).await;
        device.add_side("right".into(), right).await;
        assert_eq!(device.side_count().await, 2);

        right_handle.disconnect_on_next_write();
        assert!(device.send_audio(&frame_with(1, 1)).await, "left side still delivers");

        assert_eq!(device.side_count().await, 1);
        assert_eq!(device.state(), State::StreamInit);
        assert_eq!(
            left_handle.start_calls(),
            vec![false, true, false],
            "left restarts with other_side_present=false once the right side is gone"
        );
    }

    /// `sides.len()` is always in `{0,1,2}`, and `state == STOPPED` iff
    /// `sides.is_empty()`.
    #[tokio::test]
    async fn removing_the_last_side_returns_device_to_stopped() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        let (side, _handle) = MockSide::new(false, HI_SYNC_ID);
        device.add_side("left".into(), side).await;
        assert_eq!(device.state(), State::Streaming);

        device.remove_side("left").await;

        assert_eq!(device.side_count().await, 0);
        assert_eq!(device.state(), State::Stopped);
    }

    #[tokio::test]
    async fn volume_forwarding_targets_the_matching_side_only() {
        let device = Device::new(HI_SYNC_ID, "Aid".into(), "Aid".into());
        let (left, left_handle) = MockSide::new(false, HI_SYNC_ID);
        let (right, right_handle) = MockSide::new(true, HI_SYNC_ID);
        device.add_side("left".into(), left).await;
        device.add_side("right".into(), right).await;

        device.set_external_volume(true, -42).await;

        assert_eq!(left_handle.volume(), -42);
        assert_eq!(right_handle.volume(), 0);
    }
}
