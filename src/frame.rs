//! Frame pacing: the `xrWaitFrame` / `xrBeginFrame` / `xrEndFrame` protocol.
//!
//! One mutex and one condition variable order the three entry points across
//! application threads. `wait` blocks a second waiter until the previous
//! frame is begun, then sleeps toward the next ideal frame slot; `begin`
//! consumes the waited frame (discarding a still-open one); `end` submits
//! under the same lock and wakes the waiter.

use {
    crate::{
        backend::Backend,
        error::{RuntimeError, RuntimeResult},
    },
    log::warn,
    parking_lot::{Condvar, Mutex},
    std::time::Duration,
};

/// How far the predicted display time may fall behind the clock before the
/// pacer stops asking the application to render and substitutes an ideal
/// frame slot. The exact constant is a policy choice.
pub const CATCH_UP_THRESHOLD: f64 = 0.2;

/// Upper bound on the intra-frame wait. Expiry means the application
/// deadlocked between `xrWaitFrame` and `xrBeginFrame`.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// State guarded by the frame lock.
#[derive(Debug, Default)]
struct FrameClock {
    frame_waited: bool,
    frame_begun: bool,

    /// Index the next `wait` will pace against.
    next_frame_index: u64,

    /// Index handed out by the most recent `wait`.
    waited_frame_index: u64,

    /// Index the current `begin`/`end` pair operates on.
    current_frame_index: u64,

    last_frame_waited_time: Option<f64>,

    /// The compositor requires its first submission to be an `end_frame`;
    /// this latch stays false until one succeeds.
    can_begin_frame: bool,

    last_predicted_display_time: f64,
}

/// Result of one `wait` call, in backend seconds.
#[derive(Clone, Copy, Debug)]
pub struct WaitedFrame {
    pub predicted_display_time: f64,
    pub predicted_display_period: f64,
    pub should_render: bool,
}

/// Serializes the frame protocol across application threads.
pub struct FramePacer {
    clock: Mutex<FrameClock>,
    condvar: Condvar,
}

impl FramePacer {
    pub fn new() -> Self {
        Self {
            clock: Mutex::new(FrameClock::default()),
            condvar: Condvar::new(),
        }
    }

    /// `xrWaitFrame` body. `should_render` carries the session-state verdict
    /// computed by the caller; the catch-up rule may override it.
    #[profiling::function]
    pub fn wait(
        &self,
        backend: &dyn Backend,
        frame_duration: f64,
        mut should_render: bool,
    ) -> WaitedFrame {
        let mut clock = self.clock.lock();

        // Wait for a begin to match the previous wait.
        if clock.frame_waited {
            let timed_out = self
                .condvar
                .wait_while_for(&mut clock, |clock| !clock.frame_begun, STALL_TIMEOUT)
                .timed_out();

            if timed_out {
                warn!("wait-to-begin pairing timed out; application deadlock likely");
            }
        }

        // Sleep toward the next ideal frame slot, or until the in-flight
        // frame is submitted.
        let timeout = match clock.last_frame_waited_time {
            Some(last) => {
                let now = backend.time_now();
                let next_frame_time = last + frame_duration;

                if next_frame_time > now {
                    Duration::from_secs_f64(next_frame_time - now)
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::from_millis(100),
        };

        if !timeout.is_zero() {
            self.condvar
                .wait_while_for(&mut clock, |clock| clock.frame_begun, timeout);
        }

        let now = backend.time_now();
        let frame_index = clock.next_frame_index;
        let mut predicted = backend.predicted_display_time(frame_index);

        // When behind too far, skip rendering and substitute an ideal slot;
        // the very first frame still renders to prime the compositor.
        if predicted < now - CATCH_UP_THRESHOLD {
            should_render = frame_index == 0;
            predicted = now + frame_duration;
        }

        // The application-visible display clock never decreases.
        predicted = predicted.max(clock.last_predicted_display_time);
        clock.last_predicted_display_time = predicted;

        clock.frame_waited = true;
        clock.waited_frame_index = frame_index;
        clock.next_frame_index = frame_index + 1;
        clock.last_frame_waited_time = Some(backend.time_now());

        self.condvar.notify_all();

        WaitedFrame {
            predicted_display_time: predicted,
            predicted_display_period: frame_duration,
            should_render,
        }
    }

    /// `xrBeginFrame` body. Returns `true` when the previous frame was still
    /// open and is now discarded.
    #[profiling::function]
    pub fn begin(&self, backend: &dyn Backend) -> RuntimeResult<bool> {
        let mut clock = self.clock.lock();

        if !clock.frame_waited {
            return Err(RuntimeError::CallOrderInvalid);
        }

        let discarded = clock.frame_begun;
        clock.current_frame_index = clock.waited_frame_index;

        // The compositor rejects a begin before its first end; a begin that
        // fails afterwards is not fatal for the frame either.
        if clock.can_begin_frame {
            if let Err(err) = backend.begin_frame(clock.current_frame_index) {
                warn!("backend begin_frame({}): {err}", clock.current_frame_index);
            }
        }

        clock.frame_waited = false;
        clock.frame_begun = true;

        self.condvar.notify_all();

        Ok(discarded)
    }

    /// `xrEndFrame` body. Runs `submit` with the current frame index while
    /// the frame lock is held; `submit` reports whether it handed layers to
    /// the compositor (which arms the begin latch). Errors propagate without
    /// closing the frame.
    #[profiling::function]
    pub fn end(&self, submit: impl FnOnce(u64) -> RuntimeResult<bool>) -> RuntimeResult<()> {
        let mut clock = self.clock.lock();

        if !clock.frame_begun {
            return Err(RuntimeError::CallOrderInvalid);
        }

        if submit(clock.current_frame_index)? {
            clock.can_begin_frame = true;
        }

        clock.frame_begun = false;

        self.condvar.notify_all();

        Ok(())
    }

    /// Resets the protocol, used when a session is (re)created.
    pub fn reset(&self) {
        let mut clock = self.clock.lock();

        *clock = FrameClock::default();

        self.condvar.notify_all();
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::backend::mock::MockHmd};

    const FRAME: f64 = 1.0 / 90.0;

    #[test]
    pub fn begin_before_wait_is_out_of_order() {
        let pacer = FramePacer::new();
        let hmd = MockHmd::default();

        assert_eq!(pacer.begin(&hmd), Err(RuntimeError::CallOrderInvalid));
    }

    #[test]
    pub fn end_before_begin_is_out_of_order() {
        let pacer = FramePacer::new();

        assert_eq!(pacer.end(|_| Ok(true)), Err(RuntimeError::CallOrderInvalid));
    }

    #[test]
    pub fn triad_runs_in_order() {
        let pacer = FramePacer::new();
        let hmd = MockHmd::default();

        let frame = pacer.wait(&hmd, FRAME, true);
        assert!(frame.should_render);
        assert!(!pacer.begin(&hmd).unwrap());

        let mut submitted_index = None;
        pacer
            .end(|index| {
                submitted_index = Some(index);
                Ok(true)
            })
            .unwrap();

        assert_eq!(submitted_index, Some(0));
    }

    #[test]
    pub fn first_begin_skips_backend() {
        let pacer = FramePacer::new();
        let hmd = MockHmd::default();

        pacer.wait(&hmd, FRAME, true);
        pacer.begin(&hmd).unwrap();
        assert!(hmd.journal().is_empty());

        pacer.end(|_| Ok(true)).unwrap();

        // The latch is armed now; the second begin reaches the backend.
        pacer.wait(&hmd, FRAME, true);
        pacer.begin(&hmd).unwrap();
        assert_eq!(
            hmd.journal().last(),
            Some(&crate::backend::mock::JournalEvent::BeginFrame(1))
        );
    }

    #[test]
    pub fn double_begin_discards() {
        let pacer = FramePacer::new();
        let hmd = MockHmd::default();

        pacer.wait(&hmd, FRAME, true);
        pacer.begin(&hmd).unwrap();
        pacer.wait(&hmd, FRAME, true);

        assert!(pacer.begin(&hmd).unwrap());

        // The open pair continues with the second frame's index.
        pacer
            .end(|index| {
                assert_eq!(index, 1);
                Ok(true)
            })
            .unwrap();
    }

    #[test]
    pub fn predicted_time_is_monotonic() {
        let pacer = FramePacer::new();
        let hmd = MockHmd::default();
        let mut last = 0.0;

        for _ in 0..4 {
            let frame = pacer.wait(&hmd, FRAME, true);
            assert!(frame.predicted_display_time >= last);
            last = frame.predicted_display_time;

            pacer.begin(&hmd).unwrap();
            pacer.end(|_| Ok(true)).unwrap();
        }
    }

    #[test]
    pub fn catch_up_skips_rendering_but_not_frame_zero() {
        let pacer = FramePacer::new();
        let hmd = MockHmd::default();

        // Frame zero always renders, even when the pacer is behind.
        hmd.advance(5.0);
        let frame = pacer.wait(&hmd, FRAME, true);
        assert!(frame.should_render);
        pacer.begin(&hmd).unwrap();
        pacer.end(|_| Ok(true)).unwrap();

        // Subsequent far-behind frames are skipped and get an ideal slot.
        hmd.advance(5.0);
        let now = hmd.time_now();
        let frame = pacer.wait(&hmd, FRAME, true);
        assert!(!frame.should_render);
        assert!(frame.predicted_display_time >= now);

        pacer.begin(&hmd).unwrap();
        pacer.end(|_| Ok(true)).unwrap();
    }

    #[test]
    pub fn failed_submit_keeps_frame_open() {
        let pacer = FramePacer::new();
        let hmd = MockHmd::default();

        pacer.wait(&hmd, FRAME, true);
        pacer.begin(&hmd).unwrap();

        assert_eq!(
            pacer.end(|_| Err(RuntimeError::SwapchainRectInvalid)),
            Err(RuntimeError::SwapchainRectInvalid)
        );

        // The frame is still open; a corrected end succeeds.
        pacer.end(|_| Ok(true)).unwrap();
    }
}
