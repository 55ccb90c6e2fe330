//! Reset-button hold detection shared between an edge interrupt and the
//! main loop.
//!
//! The interrupt side only records timestamps. Elapsed time is judged in
//! `poll`, which runs in normal task context and may start the reset.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldStatus {
    Released,
    Holding { held_ms: u32 },
    /// Reported once per sustained hold.
    ResetRequested,
}

pub struct HoldDetector {
    press_started_ms: AtomicU32,
    holding: AtomicBool,
    /// Set once a hold has fired, cleared by the next release.
    fired: AtomicBool,
    threshold_ms: u32,
}

impl HoldDetector {
    pub const fn new(threshold_ms: u32) -> Self {
        Self {
            press_started_ms: AtomicU32::new(0),
            holding: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            threshold_ms,
        }
    }

    /// Records a button edge. Safe to call from an interrupt handler.
    /// `now_ms` is a wrapping millisecond clock.
    pub fn on_edge(&self, pressed: bool, now_ms: u32) {
        if pressed {
            self.press_started_ms.store(now_ms, Ordering::Relaxed);
            self.fired.store(false, Ordering::Relaxed);
            self.holding.store(true, Ordering::Release);
        } else {
            self.release();
        }
    }

    /// Reconciles the detector with a sampled pin level, for edges that
    /// arrived while the interrupt was disarmed. A missed press is timed from
    /// `now_ms`. A button still down after its hold fired is not re-armed.
    pub fn sync_level(&self, pressed: bool, now_ms: u32) {
        if !pressed {
            if self.holding.load(Ordering::Acquire) || self.fired.load(Ordering::Relaxed) {
                self.release();
            }
            return;
        }
        if !self.holding.load(Ordering::Acquire) && !self.fired.load(Ordering::Relaxed) {
            self.press_started_ms.store(now_ms, Ordering::Relaxed);
            self.holding.store(true, Ordering::Release);
        }
    }

    fn release(&self) {
        self.holding.store(false, Ordering::Release);
        self.fired.store(false, Ordering::Relaxed);
    }

    pub fn is_holding(&self) -> bool {
        self.holding.load(Ordering::Acquire)
    }

    pub fn poll(&self, now_ms: u32) -> HoldStatus {
        if !self.holding.load(Ordering::Acquire) {
            return HoldStatus::Released;
        }

        let held_ms = now_ms.wrapping_sub(self.press_started_ms.load(Ordering::Relaxed));
        if held_ms < self.threshold_ms {
            return HoldStatus::Holding { held_ms };
        }

        match self
            .holding
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.fired.store(true, Ordering::Relaxed);
                HoldStatus::ResetRequested
            }
            Err(_) => HoldStatus::Released,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HOLD_THRESHOLD_MS;

    #[test]
    fn release_before_threshold_never_requests_reset() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        detector.on_edge(true, 1_000);
        assert_eq!(detector.poll(3_000), HoldStatus::Holding { held_ms: 2_000 });

        detector.on_edge(false, 4_000);
        assert_eq!(detector.poll(10_000), HoldStatus::Released);
    }

    #[test]
    fn hold_just_short_of_threshold_does_not_fire() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        detector.on_edge(true, 0);
        assert_eq!(detector.poll(4_999), HoldStatus::Holding { held_ms: 4_999 });
    }

    #[test]
    fn sustained_hold_fires_exactly_once() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        detector.on_edge(true, 0);

        assert_eq!(detector.poll(5_000), HoldStatus::ResetRequested);
        assert_eq!(detector.poll(5_001), HoldStatus::Released);
        assert_eq!(detector.poll(9_000), HoldStatus::Released);
        assert!(!detector.is_holding());
    }

    #[test]
    fn elapsed_time_survives_clock_wraparound() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        let start = u32::MAX - 1_000;
        detector.on_edge(true, start);

        assert_eq!(
            detector.poll(start.wrapping_add(4_000)),
            HoldStatus::Holding { held_ms: 4_000 }
        );
        assert_eq!(
            detector.poll(start.wrapping_add(6_000)),
            HoldStatus::ResetRequested
        );
    }

    #[test]
    fn new_press_restarts_timing() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        detector.on_edge(true, 0);
        detector.on_edge(false, 3_000);
        detector.on_edge(true, 4_000);

        assert_eq!(detector.poll(8_000), HoldStatus::Holding { held_ms: 4_000 });
        assert_eq!(detector.poll(9_000), HoldStatus::ResetRequested);
    }

    #[test]
    fn sampled_release_cancels_missed_edge() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        detector.on_edge(true, 0);

        detector.sync_level(true, 1_000);
        assert_eq!(detector.poll(1_000), HoldStatus::Holding { held_ms: 1_000 });

        detector.sync_level(false, 2_000);
        assert_eq!(detector.poll(6_000), HoldStatus::Released);
    }

    #[test]
    fn sampled_press_starts_a_hold_when_the_edge_was_missed() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        detector.sync_level(true, 2_000);

        assert_eq!(detector.poll(6_999), HoldStatus::Holding { held_ms: 4_999 });
        assert_eq!(detector.poll(7_000), HoldStatus::ResetRequested);
    }

    #[test]
    fn button_still_down_after_firing_is_not_rearmed() {
        let detector = HoldDetector::new(HOLD_THRESHOLD_MS);
        detector.on_edge(true, 0);
        assert_eq!(detector.poll(5_000), HoldStatus::ResetRequested);

        detector.sync_level(true, 5_020);
        assert_eq!(detector.poll(20_000), HoldStatus::Released);

        detector.sync_level(false, 20_020);
        detector.sync_level(true, 21_000);
        assert_eq!(detector.poll(26_000), HoldStatus::ResetRequested);
    }

    #[test]
    fn static_detector_is_usable_from_an_isr_context() {
        static DETECTOR: HoldDetector = HoldDetector::new(HOLD_THRESHOLD_MS);
        DETECTOR.on_edge(true, 10);
        assert!(DETECTOR.is_holding());
        DETECTOR.on_edge(false, 20);
        assert!(!DETECTOR.is_holding());
    }
}
