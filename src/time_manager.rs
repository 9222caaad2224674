//! Process clock with LIVE and BACKTEST modes.
//!
//! Every component that needs a timestamp holds an `Arc<TimeManager>` and
//! calls [`TimeManager::now_ms`] — nothing else reads the wall clock. In
//! BACKTEST mode the replay controller sets the virtual time before each
//! emission, which is what makes backtests deterministic.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ExchangeError, ExchangeResult};

/// Clock mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimeMode {
    Live,
    Backtest,
}

#[derive(Debug)]
struct ClockState {
    mode: TimeMode,
    /// Virtual time in ms; meaningful only in Backtest mode.
    virtual_ms: i64,
}

/// Shared clock. Cheap to lock: state is two words.
#[derive(Debug)]
pub struct TimeManager {
    state: Mutex<ClockState>,
}

impl TimeManager {
    /// Live clock (wall time).
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                mode: TimeMode::Live,
                virtual_ms: 0,
            }),
        }
    }

    /// Backtest clock starting at `start_ms`.
    pub fn backtest(start_ms: i64) -> Self {
        Self {
            state: Mutex::new(ClockState {
                mode: TimeMode::Backtest,
                virtual_ms: start_ms,
            }),
        }
    }

    pub fn mode(&self) -> TimeMode {
        self.state.lock().expect("clock lock").mode
    }

    pub fn set_mode(&self, mode: TimeMode) {
        self.state.lock().expect("clock lock").mode = mode;
    }

    /// Current time in unix ms: wall clock in LIVE, virtual time in BACKTEST.
    pub fn now_ms(&self) -> i64 {
        let state = self.state.lock().expect("clock lock");
        match state.mode {
            TimeMode::Live => wall_clock_ms(),
            TimeMode::Backtest => state.virtual_ms,
        }
    }

    /// Set the virtual time. Backward jumps are rejected: replay input must
    /// be time-ordered, and a rewinding clock would corrupt every timestamp
    /// downstream.
    pub fn set_backtest_time(&self, t_ms: i64) -> ExchangeResult<()> {
        let mut state = self.state.lock().expect("clock lock");
        if state.mode == TimeMode::Backtest && t_ms < state.virtual_ms {
            return Err(ExchangeError::InvalidParam(format!(
                "backtest time must not move backwards: {} < {}",
                t_ms, state.virtual_ms
            )));
        }
        state.mode = TimeMode::Backtest;
        state.virtual_ms = t_ms;
        Ok(())
    }

    /// Advance the virtual clock by `dt_seconds`.
    pub fn advance(&self, dt_seconds: f64) -> ExchangeResult<()> {
        if dt_seconds < 0.0 {
            return Err(ExchangeError::InvalidParam(
                "advance requires a non-negative step".into(),
            ));
        }
        let mut state = self.state.lock().expect("clock lock");
        state.virtual_ms += (dt_seconds * 1000.0) as i64;
        Ok(())
    }
}

impl Default for TimeManager {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_mode_tracks_wall_clock() {
        let clock = TimeManager::new();
        let before = wall_clock_ms();
        let now = clock.now_ms();
        let after = wall_clock_ms();
        assert!(before <= now && now <= after);
    }

    #[test]
    fn backtest_mode_returns_virtual_time() {
        let clock = TimeManager::backtest(1_700_000_000_000);
        assert_eq!(clock.now_ms(), 1_700_000_000_000);
        clock.set_backtest_time(1_700_000_001_000).unwrap();
        assert_eq!(clock.now_ms(), 1_700_000_001_000);
    }

    #[test]
    fn backward_jump_rejected() {
        let clock = TimeManager::backtest(1000);
        assert!(clock.set_backtest_time(500).is_err());
        assert_eq!(clock.now_ms(), 1000);
    }

    #[test]
    fn equal_timestamp_accepted() {
        let clock = TimeManager::backtest(1000);
        assert!(clock.set_backtest_time(1000).is_ok());
    }

    #[test]
    fn advance_moves_clock_forward() {
        let clock = TimeManager::backtest(1000);
        clock.advance(1.5).unwrap();
        assert_eq!(clock.now_ms(), 2500);
        assert!(clock.advance(-1.0).is_err());
    }

    #[test]
    fn set_backtest_time_switches_mode() {
        let clock = TimeManager::new();
        clock.set_backtest_time(42).unwrap();
        assert_eq!(clock.mode(), TimeMode::Backtest);
        assert_eq!(clock.now_ms(), 42);
        clock.set_mode(TimeMode::Live);
        assert!(clock.now_ms() > 42);
    }
}
