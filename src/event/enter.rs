//! The built-in per-frame [`ENTER`] event and the loop that drives it.
//!
//! Subsystems that need to run once per logical frame (physics integration,
//! animation, AI) bind to [`ENTER`]. The host either triggers it itself from
//! its main loop, or starts [`Bus::enter_loop`], which broadcasts it from a
//! background thread at a fixed rate until stopped.

use crossbeam_channel::{Sender, TryRecvError, bounded, select, tick};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::event::binding::UnsafeEventID;
use crate::event::bus::Bus;
use crate::event::typed::EventID;

/// Triggered once per frame, for every caller bound to it.
pub const ENTER: EventID<EnterPayload> = EventID::from_raw(UnsafeEventID(1));

/// Payload of [`ENTER`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EnterPayload {
    /// Frames triggered so far, this one included.
    pub frames_elapsed: u64,
    /// Wall time since the previous frame.
    pub since_last_frame: Duration,
    /// `since_last_frame` relative to the intended frame delay. Values above
    /// 1.0 mean the frame is late.
    pub tick_percent: f64,
}

impl EnterPayload {
    /// Build the payload for the next frame.
    pub fn next(&self, since_last_frame: Duration, frame_delay: Duration) -> Self {
        let tick_percent = if frame_delay.is_zero() {
            1.0
        } else {
            since_last_frame.as_secs_f64() / frame_delay.as_secs_f64()
        };
        Self {
            frames_elapsed: self.frames_elapsed + 1,
            since_last_frame,
            tick_percent,
        }
    }
}

/// Running enter loop. Stops when [`stop`](EnterLoop::stop)ped or dropped.
///
/// May be stopped from one of its own ENTER callbacks; the frame being
/// dispatched is then the last one.
pub struct EnterLoop {
    tx_stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    frames: Arc<AtomicU64>,
}

impl EnterLoop {
    /// Stop the loop and return the number of frames it triggered.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        // Closing the channel wakes the loop.
        self.tx_stop.take();
        if let Some(handle) = self.handle.take() {
            // Stopped from inside a callback of the loop: it exits once the
            // current frame returns.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.frames.load(Ordering::SeqCst)
    }
}

impl Drop for EnterLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Bus {
    /// Broadcast [`ENTER`] every `frame_delay` on a background thread.
    ///
    /// The loop only holds a [`WeakBus`](crate::event::bus::WeakBus) and ends
    /// on its own once the bus is gone.
    pub fn enter_loop(&self, frame_delay: Duration) -> EnterLoop {
        let bus = self.downgrade();
        let (tx_stop, rx_stop) = bounded::<()>(0);
        let ticker = tick(frame_delay.max(Duration::from_millis(1)));
        let frames = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&frames);

        let handle = thread::Builder::new()
            .name(format!("{}-enter", self.config().worker_name))
            .spawn(move || {
                let mut payload = EnterPayload::default();
                let mut last = Instant::now();
                loop {
                    select! {
                        recv(rx_stop) -> _ => break,
                        recv(ticker) -> now => {
                            let Ok(now) = now else { break };
                            if !matches!(rx_stop.try_recv(), Err(TryRecvError::Empty)) {
                                break;
                            }
                            let Some(bus) = bus.upgrade() else { break };
                            payload = payload.next(now.saturating_duration_since(last), frame_delay);
                            last = now;
                            counter.store(payload.frames_elapsed, Ordering::SeqCst);
                            bus.broadcast(ENTER, &payload);
                        }
                    }
                }
                debug!("[enter] loop exiting after {} frame(s)", payload.frames_elapsed);
            })
            .expect("failed to spawn enter loop thread");

        info!("[enter] loop started, frame delay {:?}", frame_delay);
        EnterLoop {
            tx_stop: Some(tx_stop),
            handle: Some(handle),
            frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::caller::CallerID;
    use crate::event::response::Response;
    use crate::event::typed::FIRST_USER_EVENT;
    use parking_lot::Mutex;

    #[test]
    fn test_enter_is_reserved() {
        assert!(ENTER.id().0 < FIRST_USER_EVENT);
    }

    #[test]
    fn test_payload_next() {
        let p = EnterPayload::default().next(Duration::from_millis(20), Duration::from_millis(10));
        assert_eq!(p.frames_elapsed, 1);
        assert!((p.tick_percent - 2.0).abs() < 1e-9);
        let q = p.next(Duration::from_millis(5), Duration::ZERO);
        assert_eq!(q.frames_elapsed, 2);
        assert!((q.tick_percent - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_enter_loop_triggers_and_stops() {
        let bus = Bus::new();
        let frames = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&frames);
        bus.bind(ENTER, CallerID(1), move |_, p: &EnterPayload| {
            counter.store(p.frames_elapsed, Ordering::SeqCst);
            Response::NONE
        });
        bus.flush();

        let enter = bus.enter_loop(Duration::from_millis(1));
        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let triggered = enter.stop();
        assert!(frames.load(Ordering::SeqCst) >= 3);
        assert!(triggered >= frames.load(Ordering::SeqCst));
    }

    #[test]
    fn test_enter_loop_stopped_from_own_callback() {
        let bus = Bus::new();
        let slot: Arc<Mutex<Option<EnterLoop>>> = Arc::new(Mutex::new(None));
        let last_seen = Arc::new(AtomicU64::new(0));
        let (tx_stopped, rx_stopped) = bounded::<u64>(1);

        let held = Arc::clone(&slot);
        let seen = Arc::clone(&last_seen);
        bus.bind(ENTER, CallerID(1), move |_, p: &EnterPayload| {
            seen.store(p.frames_elapsed, Ordering::SeqCst);
            if p.frames_elapsed >= 3 {
                let taken = held.lock().take();
                if let Some(enter) = taken {
                    let _ = tx_stopped.send(enter.stop());
                }
            }
            Response::NONE
        });
        bus.flush();

        *slot.lock() = Some(bus.enter_loop(Duration::from_millis(1)));
        let stopped_at = rx_stopped
            .recv_timeout(Duration::from_secs(5))
            .expect("loop did not stop from its own callback");
        assert!(stopped_at >= 3);

        // No frame follows the one that stopped the loop.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(last_seen.load(Ordering::SeqCst), stopped_at);
    }

    #[test]
    fn test_enter_loop_ends_with_bus() {
        let bus = Bus::new();
        let enter = bus.enter_loop(Duration::from_millis(1));
        drop(bus);
        // Returns once the loop notices the bus is gone or the stop signal.
        let _ = enter.stop();
    }
}
