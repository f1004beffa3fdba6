//! Delay scheduling for intercepted input.
//!
//! Every event that will be replayed is assigned a random release deadline
//! bounded by the operator's maximum delay. The draw is lower-bounded by
//! the deadline of the newest queued packet, which keeps release order
//! equal to arrival order without ever sorting: deadlines are
//! non-decreasing along the queue by construction.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use input::event::keyboard::KeyState;
use input::event::pointer::ButtonState;

use crate::entropy::Entropy;
use crate::xkb::ModsSnapshot;

pub const DEFAULT_MAX_DELAY_MS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollSource {
    Wheel,
    Finger,
    Continuous,
}

/// Replay-ready content of a buffered event.
///
/// Pointer motion carries the absolute virtual-cursor position in global
/// space; everything else carries the fields the replayer needs to
/// reconstruct the protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Motion {
        x: i32,
        y: i32,
    },
    Button {
        button: u32,
        state: ButtonState,
    },
    Scroll {
        source: ScrollSource,
        horizontal: Option<f64>,
        vertical: Option<f64>,
    },
    Key {
        key: u32,
        state: KeyState,
        /// Modifier snapshot taken right after this key updated the local
        /// XKB state; `None` when no keymap had arrived yet.
        mods: Option<ModsSnapshot>,
    },
}

impl Payload {
    fn is_motion(&self) -> bool {
        matches!(self, Payload::Motion { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputPacket {
    pub payload: Payload,
    /// Monotonic millisecond deadline for release.
    pub sched_time: i64,
}

#[derive(Debug)]
pub struct Scheduler {
    queue: VecDeque<InputPacket>,
    prev_release_time: i64,
    max_delay: i64,
}

impl Scheduler {
    pub fn new(max_delay: i64) -> Self {
        assert!(max_delay >= 0);
        Self {
            queue: VecDeque::new(),
            prev_release_time: 0,
            max_delay,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// If the queue tail is a still-pending motion packet, folds the new
    /// cursor position into it and reports success. A motion arriving
    /// behind a key or click must not be folded backwards past it, so any
    /// other tail refuses.
    pub fn coalesce_motion(&mut self, x: i32, y: i32) -> bool {
        match self.queue.back_mut() {
            Some(packet) if packet.payload.is_motion() => {
                packet.payload = Payload::Motion { x, y };
                true
            }
            _ => false,
        }
    }

    /// Appends a packet with a fresh random delay.
    pub fn enqueue(&mut self, payload: Payload, now: i64, entropy: &mut Entropy) -> Result<()> {
        let lower = (self.prev_release_time - now).max(0).min(self.max_delay);
        let delay = entropy.uniform_in(lower, self.max_delay)?;
        let sched_time = now
            .checked_add(delay)
            .context("scheduled release time overflowed")?;

        self.queue.push_back(InputPacket {
            payload,
            sched_time,
        });
        self.prev_release_time = sched_time;
        Ok(())
    }

    /// Pops the head packet if its deadline has passed.
    pub fn pop_due(&mut self, now: i64) -> Option<InputPacket> {
        if self.queue.front()?.sched_time <= now {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.queue.front().map(|p| p.sched_time)
    }

    /// Poll timeout until the head deadline; `None` means sleep forever.
    pub fn timeout(&self, now: i64) -> Option<Duration> {
        let deadline = self.next_deadline()?;
        Some(Duration::from_millis((deadline - now).max(0) as u64))
    }

    #[cfg(test)]
    fn packets(&self) -> impl Iterator<Item = &InputPacket> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motion(x: i32, y: i32) -> Payload {
        Payload::Motion { x, y }
    }

    fn click() -> Payload {
        Payload::Button {
            button: 0x110,
            state: ButtonState::Pressed,
        }
    }

    #[test]
    fn delay_is_bounded() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);
        for i in 0..1000 {
            let now = i * 3;
            sched.enqueue(click(), now, &mut entropy).unwrap();
            let tail = sched.packets().last().unwrap();
            assert!(tail.sched_time >= now);
            assert!(tail.sched_time <= now + 100);
        }
    }

    #[test]
    fn deadlines_non_decreasing() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);
        for _ in 0..1000 {
            sched.enqueue(click(), 50, &mut entropy).unwrap();
        }
        let mut prev = 0;
        for packet in sched.packets() {
            assert!(packet.sched_time >= prev);
            prev = packet.sched_time;
        }
    }

    #[test]
    fn later_arrival_not_released_before_backlog() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);
        // Build up a backlog far in the future of the second arrival.
        for _ in 0..50 {
            sched.enqueue(click(), 1000, &mut entropy).unwrap();
        }
        let backlog_deadline = sched.packets().last().unwrap().sched_time;
        sched.enqueue(click(), 1001, &mut entropy).unwrap();
        assert!(sched.packets().last().unwrap().sched_time >= backlog_deadline);
    }

    #[test]
    fn zero_delay_releases_immediately() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(0);
        sched.enqueue(click(), 42, &mut entropy).unwrap();
        assert_eq!(sched.next_deadline(), Some(42));
        assert!(sched.pop_due(42).is_some());
    }

    #[test]
    fn coalesces_into_trailing_motion() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);

        assert!(!sched.coalesce_motion(10, 10));
        sched.enqueue(motion(10, 10), 0, &mut entropy).unwrap();
        assert!(sched.coalesce_motion(20, 25));
        assert_eq!(sched.len(), 1);
        assert_eq!(
            sched.packets().next().unwrap().payload,
            Payload::Motion { x: 20, y: 25 },
        );
    }

    #[test]
    fn motion_does_not_overtake_click() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);
        sched.enqueue(motion(10, 10), 0, &mut entropy).unwrap();
        sched.enqueue(click(), 0, &mut entropy).unwrap();
        // The tail is a click now, so a new motion must queue behind it.
        assert!(!sched.coalesce_motion(30, 30));
        sched.enqueue(motion(30, 30), 1, &mut entropy).unwrap();
        assert_eq!(sched.len(), 3);
    }

    #[test]
    fn keystroke_press_release_sequencing() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);

        // Key 30 pressed at t = 1000.
        sched
            .enqueue(
                Payload::Key {
                    key: 30,
                    state: KeyState::Pressed,
                    mods: None,
                },
                1000,
                &mut entropy,
            )
            .unwrap();
        let press_deadline = sched.next_deadline().unwrap();
        assert!((1000..=1100).contains(&press_deadline));
        assert!(sched.pop_due(press_deadline).is_some());

        // The matching release at t = 1200 must land in
        // [max(press_deadline, 1200), 1300].
        sched
            .enqueue(
                Payload::Key {
                    key: 30,
                    state: KeyState::Released,
                    mods: None,
                },
                1200,
                &mut entropy,
            )
            .unwrap();
        let release_deadline = sched.next_deadline().unwrap();
        assert!(release_deadline >= press_deadline.max(1200));
        assert!(release_deadline <= 1300);
    }

    #[test]
    fn pop_due_respects_deadline() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(0);
        sched.enqueue(click(), 100, &mut entropy).unwrap();
        assert!(sched.pop_due(99).is_none());
        assert!(sched.pop_due(100).is_some());
        assert!(sched.pop_due(100).is_none());
    }

    #[test]
    fn release_order_matches_arrival_order() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);

        sched.enqueue(motion(1, 1), 0, &mut entropy).unwrap();
        sched.enqueue(click(), 1, &mut entropy).unwrap();
        sched.enqueue(motion(2, 2), 2, &mut entropy).unwrap();
        sched
            .enqueue(
                Payload::Key {
                    key: 30,
                    state: KeyState::Pressed,
                    mods: None,
                },
                3,
                &mut entropy,
            )
            .unwrap();

        let mut kinds = Vec::new();
        while let Some(packet) = sched.pop_due(i64::from(u32::MAX)) {
            kinds.push(match packet.payload {
                Payload::Motion { .. } => "motion",
                Payload::Button { .. } => "button",
                Payload::Scroll { .. } => "scroll",
                Payload::Key { .. } => "key",
            });
        }
        assert_eq!(kinds, ["motion", "button", "motion", "key"]);
    }

    #[test]
    fn coalescing_keeps_the_deadline() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(100);
        sched.enqueue(motion(1, 1), 0, &mut entropy).unwrap();
        let deadline = sched.next_deadline().unwrap();
        assert!(sched.coalesce_motion(9, 9));
        assert_eq!(sched.next_deadline(), Some(deadline));
    }

    #[test]
    fn timeout_tracks_head() {
        let mut entropy = Entropy::new();
        let mut sched = Scheduler::new(0);
        assert_eq!(sched.timeout(0), None);
        sched.enqueue(click(), 30, &mut entropy).unwrap();
        assert_eq!(sched.timeout(10), Some(Duration::from_millis(20)));
        assert_eq!(sched.timeout(50), Some(Duration::ZERO));
    }
}
