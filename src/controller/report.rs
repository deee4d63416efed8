//! Controller state and the 255-tick chunking rule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{ControllerReport, Request};

/// One device tick.
pub const TICK: Duration = Duration::from_millis(15);

/// Longest continuous state one message may carry.
pub const MAX_TICKS_PER_MESSAGE: u32 = 255;

/// Rounds up so a non-zero duration is never dropped.
pub fn duration_to_ticks(duration: Duration) -> u32 {
    let tick_ms = TICK.as_millis();
    let ticks = duration.as_millis().div_ceil(tick_ms);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

/// Splits `total` ticks into protocol-legal chunks. The last one may be shorter.
pub fn split_ticks(total: u32) -> impl Iterator<Item = u8> {
    let mut left = total;
    std::iter::from_fn(move || {
        if left == 0 {
            return None;
        }
        let chunk = left.min(MAX_TICKS_PER_MESSAGE);
        left -= chunk;
        Some(chunk as u8)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    Y,
    B,
    A,
    X,
    L,
    R,
    ZL,
    ZR,
    Minus,
    Plus,
    LeftStick,
    RightStick,
    Home,
    Capture,
}

impl Button {
    fn mask(self) -> u16 {
        1 << (self as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dpad {
    Up,
    UpRight,
    Right,
    DownRight,
    Down,
    DownLeft,
    Left,
    UpLeft,
    #[default]
    Center,
}

impl Dpad {
    fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stick {
    Left,
    Right,
}

/// Requested buttons and stick positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    report: ControllerReport,
}

impl ControllerState {
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn with_button(mut self, button: Button) -> Self {
        self.report.buttons |= button.mask();
        self
    }

    pub fn with_dpad(mut self, dpad: Dpad) -> Self {
        self.report.dpad = dpad.code();
        self
    }

    /// Positions are raw device values, 0x80 is centred.
    pub fn with_stick(mut self, stick: Stick, x: u8, y: u8) -> Self {
        match stick {
            Stick::Left => {
                self.report.left_x = x;
                self.report.left_y = y;
            }
            Stick::Right => {
                self.report.right_x = x;
                self.report.right_y = y;
            }
        }
        self
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.report.buttons & button.mask() != 0
    }

    pub fn is_neutral(&self) -> bool {
        self.report.is_neutral()
    }

    pub fn report(&self) -> ControllerReport {
        self.report
    }
}

/// A state held for a duration, before chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStateReport {
    pub state: ControllerState,
    pub ticks: u32,
    pub active: bool,
}

impl ControllerStateReport {
    pub fn new(state: ControllerState, duration: Duration, active: bool) -> Self {
        Self {
            state,
            ticks: duration_to_ticks(duration),
            active,
        }
    }

    /// `ceil(ticks / 255)` requests carrying the same state and active flag.
    pub fn chunks(&self) -> Vec<Request> {
        let report = self.state.report();
        split_ticks(self.ticks)
            .map(|ticks| Request::ControllerState {
                ticks,
                active: self.active,
                report,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_ticks(report: &ControllerStateReport) -> Vec<u32> {
        report
            .chunks()
            .into_iter()
            .map(|request| match request {
                Request::ControllerState { ticks, .. } => u32::from(ticks),
                other => panic!("unexpected request {other:?}"),
            })
            .collect()
    }

    #[test]
    fn long_durations_split_into_bounded_chunks() {
        for total in [1, 254, 255, 256, 510, 511, 1000, 65_535] {
            let report = ControllerStateReport {
                state: ControllerState::neutral(),
                ticks: total,
                active: true,
            };
            let chunks = chunk_ticks(&report);
            assert_eq!(chunks.len() as u32, total.div_ceil(255), "total {total}");
            assert!(chunks.iter().all(|&t| t > 0 && t <= 255));
            assert_eq!(chunks.iter().sum::<u32>(), total);
            assert!(chunks[..chunks.len() - 1].iter().all(|&t| t == 255));
        }
    }

    #[test]
    fn zero_duration_issues_nothing() {
        let report = ControllerStateReport::new(ControllerState::neutral(), Duration::ZERO, false);
        assert!(report.chunks().is_empty());
    }

    #[test]
    fn chunks_carry_the_same_state_and_flag() {
        let state = ControllerState::neutral()
            .with_button(Button::A)
            .with_stick(Stick::Left, 0, 0xff);
        let report = ControllerStateReport::new(state, Duration::from_secs(5), true);
        let chunks = report.chunks();
        assert_eq!(chunks.len(), 2);
        for chunk in chunks {
            match chunk {
                Request::ControllerState { active, report, .. } => {
                    assert!(active);
                    assert_eq!(report, state.report());
                }
                other => panic!("unexpected request {other:?}"),
            }
        }
    }

    #[test]
    fn durations_round_up_to_whole_ticks() {
        assert_eq!(duration_to_ticks(Duration::from_millis(15)), 1);
        assert_eq!(duration_to_ticks(Duration::from_millis(16)), 2);
        assert_eq!(duration_to_ticks(Duration::from_millis(3825)), 255);
        assert_eq!(duration_to_ticks(Duration::ZERO), 0);
    }

    #[test]
    fn buttons_map_to_distinct_bits() {
        let state = ControllerState::neutral()
            .with_button(Button::A)
            .with_button(Button::Capture);
        assert!(state.is_pressed(Button::A));
        assert!(state.is_pressed(Button::Capture));
        assert!(!state.is_pressed(Button::B));
        assert_eq!(state.report().buttons, (1 << 2) | (1 << 13));
        assert!(!state.is_neutral());
        assert!(ControllerState::neutral().with_dpad(Dpad::Center).is_neutral());
    }
}
