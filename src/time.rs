//! Time base conversion.
//!
//! The backend counts fractional seconds as `f64`; OpenXR counts `XrTime`
//! nanoseconds; Win32 applications additionally speak performance-counter
//! ticks. One calibrated offset relates the backend clock to the performance
//! counter, computed once at startup as the minimum over repeated samples
//! (the minimum rejects scheduling noise between the two reads).

use crate::backend::Backend;
use openxr_sys as sys;

#[cfg(not(windows))]
mod counter {
    use std::{sync::OnceLock, time::Instant};

    static ORIGIN: OnceLock<Instant> = OnceLock::new();

    /// Monotonic tick count standing in for QueryPerformanceCounter.
    pub fn now() -> i64 {
        ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as i64
    }

    pub fn frequency() -> i64 {
        1_000_000_000
    }
}

#[cfg(windows)]
mod counter {
    use windows::Win32::System::Performance::{
        QueryPerformanceCounter, QueryPerformanceFrequency,
    };

    pub fn now() -> i64 {
        let mut value = 0i64;

        // Cannot fail on XP-or-later systems.
        unsafe {
            let _ = QueryPerformanceCounter(&mut value);
        }

        value
    }

    pub fn frequency() -> i64 {
        let mut value = 0i64;

        unsafe {
            let _ = QueryPerformanceFrequency(&mut value);
        }

        value
    }
}

const CALIBRATION_SAMPLES: u32 = 100;

/// Relates backend seconds, `XrTime` and performance-counter ticks.
#[derive(Clone, Copy, Debug)]
pub struct TimeConverter {
    counter_frequency: i64,

    /// `backend_now - counter_now_seconds`, minimized over the calibration
    /// samples.
    backend_from_counter_offset: f64,
}

impl TimeConverter {
    /// Calibrates against the given backend clock.
    pub fn calibrate(backend: &dyn Backend) -> Self {
        let counter_frequency = counter::frequency();
        let mut offset = f64::INFINITY;

        for _ in 0..CALIBRATION_SAMPLES {
            let counter_seconds = counter::now() as f64 / counter_frequency as f64;

            offset = offset.min(backend.time_now() - counter_seconds);
        }

        Self {
            counter_frequency,
            backend_from_counter_offset: offset,
        }
    }

    pub fn backend_to_xr(&self, seconds: f64) -> sys::Time {
        sys::Time::from_nanos((seconds * 1e9).round() as i64)
    }

    pub fn xr_to_backend(&self, time: sys::Time) -> f64 {
        time.as_nanos() as f64 * 1e-9
    }

    pub fn counter_to_xr(&self, counter: i64) -> sys::Time {
        let seconds =
            counter as f64 / self.counter_frequency as f64 + self.backend_from_counter_offset;

        self.backend_to_xr(seconds)
    }

    pub fn xr_to_counter(&self, time: sys::Time) -> i64 {
        let seconds = self.xr_to_backend(time) - self.backend_from_counter_offset;

        (seconds * self.counter_frequency as f64).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::backend::mock::MockHmd};

    #[test]
    pub fn backend_round_trip() {
        let hmd = MockHmd::default();
        let converter = TimeConverter::calibrate(&hmd);

        let time = converter.backend_to_xr(123.456_789);

        assert!((converter.xr_to_backend(time) - 123.456_789).abs() < 1e-9);
    }

    #[test]
    pub fn counter_round_trip_within_one_tick() {
        let hmd = MockHmd::default();
        let converter = TimeConverter::calibrate(&hmd);

        let counter = counter::now();
        let round_tripped = converter.xr_to_counter(converter.counter_to_xr(counter));
        let tick_error = (round_tripped - counter).abs();

        // One tick of slack for the nanosecond rounding in XrTime.
        assert!(tick_error <= 1, "off by {tick_error} ticks");
    }

    #[test]
    pub fn offset_is_finite_after_calibration() {
        let hmd = MockHmd::default();
        let converter = TimeConverter::calibrate(&hmd);

        assert!(converter.backend_from_counter_offset.is_finite());
    }

    #[test]
    pub fn xr_time_is_nanoseconds() {
        let hmd = MockHmd::default();
        let converter = TimeConverter::calibrate(&hmd);

        assert_eq!(converter.backend_to_xr(1.0).as_nanos(), 1_000_000_000);
        assert_eq!(converter.backend_to_xr(0.5).as_nanos(), 500_000_000);
    }
}
