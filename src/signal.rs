//! Adaptive traffic-signal state machine.
//!
//! Phases cycle GREEN → YELLOW → RED → GREEN. The duration of each phase is
//! chosen from [`PhaseTimings`] using the congestion tier in force when the
//! phase begins and stays fixed until the phase ends. The machine has no
//! timer of its own: the pipeline evaluates it once per cycle with the
//! current instant.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::congestion::CongestionTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Green,
    Yellow,
    Red,
}

impl Phase {
    /// The only permitted successor of each phase.
    pub fn next(self) -> Phase {
        match self {
            Phase::Green => Phase::Yellow,
            Phase::Yellow => Phase::Red,
            Phase::Red => Phase::Green,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Green => "GREEN",
            Phase::Yellow => "YELLOW",
            Phase::Red => "RED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tier durations, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierDurations {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl TierDurations {
    pub fn for_tier(&self, tier: CongestionTier) -> Duration {
        Duration::from_secs(match tier {
            CongestionTier::Low => self.low,
            CongestionTier::Medium => self.medium,
            CongestionTier::High => self.high,
        })
    }
}

/// Phase duration table. Green shortens and red lengthens as congestion
/// rises; yellow is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTimings {
    pub green: TierDurations,
    pub yellow_secs: u64,
    pub red: TierDurations,
}

impl Default for PhaseTimings {
    fn default() -> Self {
        Self {
            green: TierDurations {
                low: 30,
                medium: 20,
                high: 15,
            },
            yellow_secs: 3,
            red: TierDurations {
                low: 15,
                medium: 25,
                high: 35,
            },
        }
    }
}

impl PhaseTimings {
    pub fn duration(&self, phase: Phase, tier: CongestionTier) -> Duration {
        match phase {
            Phase::Green => self.green.for_tier(tier),
            Phase::Yellow => Duration::from_secs(self.yellow_secs),
            Phase::Red => self.red.for_tier(tier),
        }
    }
}

/// The live signal. A plain value: transitions return a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalState {
    pub phase: Phase,
    pub phase_started_at: Instant,
    pub phase_duration: Duration,
    /// Tier the current phase's duration was taken from.
    pub scheduled_tier: CongestionTier,
}

impl SignalState {
    /// GREEN with the LOW-tier duration.
    pub fn initial(now: Instant, timings: &PhaseTimings) -> Self {
        Self {
            phase: Phase::Green,
            phase_started_at: now,
            phase_duration: timings.duration(Phase::Green, CongestionTier::Low),
            scheduled_tier: CongestionTier::Low,
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.phase_started_at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.phase_duration.saturating_sub(self.elapsed(now))
    }

    /// Evaluates the machine at `now`.
    ///
    /// When the current phase has run its full duration, moves to the next
    /// phase, starting at `now` with a duration taken from `tier`. At most one
    /// transition happens per evaluation; `tier` has no effect on a phase
    /// already under way.
    pub fn advance(&self, now: Instant, tier: CongestionTier, timings: &PhaseTimings) -> Self {
        if self.elapsed(now) < self.phase_duration {
            return *self;
        }
        let phase = self.phase.next();
        Self {
            phase,
            phase_started_at: now,
            phase_duration: timings.duration(phase, tier),
            scheduled_tier: tier,
        }
    }
}

/// Owns the single live [`SignalState`] and its timing table.
#[derive(Debug, Clone)]
pub struct SignalController {
    timings: PhaseTimings,
    state: SignalState,
}

impl SignalController {
    pub fn new(timings: PhaseTimings, now: Instant) -> Self {
        Self {
            state: SignalState::initial(now, &timings),
            timings,
        }
    }

    pub fn state(&self) -> SignalState {
        self.state
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    /// Computes the state at `now` without applying it.
    pub fn preview(&self, now: Instant, tier: CongestionTier) -> SignalState {
        self.state.advance(now, tier, &self.timings)
    }

    /// Installs a state obtained from [`SignalController::preview`]. Returns
    /// the phase that ended, if the commit is a transition.
    pub fn commit(&mut self, next: SignalState) -> Option<Phase> {
        let previous = self.state.phase;
        self.state = next;
        (previous != next.phase).then_some(previous)
    }

    /// Convenience: preview and commit in one step.
    pub fn tick(&mut self, now: Instant, tier: CongestionTier) -> Option<Phase> {
        let next = self.preview(now, tier);
        self.commit(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn cycle_durations(tier: CongestionTier) -> (u64, u64, u64) {
        let t = PhaseTimings::default();
        (
            t.duration(Phase::Green, tier).as_secs(),
            t.duration(Phase::Yellow, tier).as_secs(),
            t.duration(Phase::Red, tier).as_secs(),
        )
    }

    #[test]
    fn test_default_tables() {
        assert_eq!(cycle_durations(CongestionTier::Low), (30, 3, 15));
        assert_eq!(cycle_durations(CongestionTier::Medium), (20, 3, 25));
        assert_eq!(cycle_durations(CongestionTier::High), (15, 3, 35));
    }

    #[test]
    fn test_initial_state_is_green_low() {
        let t0 = Instant::now();
        let ctl = SignalController::new(PhaseTimings::default(), t0);

        assert_eq!(ctl.state().phase, Phase::Green);
        assert_eq!(ctl.state().phase_duration, secs(30));
        assert_eq!(ctl.state().remaining(t0), secs(30));
    }

    #[test]
    fn test_no_transition_before_duration_elapses() {
        let t0 = Instant::now();
        let mut ctl = SignalController::new(PhaseTimings::default(), t0);

        assert_eq!(ctl.tick(t0 + Duration::from_millis(29_999), CongestionTier::Low), None);
        assert_eq!(ctl.state().phase, Phase::Green);
    }

    #[test]
    fn test_transition_at_exact_duration() {
        let t0 = Instant::now();
        let mut ctl = SignalController::new(PhaseTimings::default(), t0);

        assert_eq!(ctl.tick(t0 + secs(30), CongestionTier::Low), Some(Phase::Green));
        assert_eq!(ctl.state().phase, Phase::Yellow);
        assert_eq!(ctl.state().phase_started_at, t0 + secs(30));
        assert_eq!(ctl.state().phase_duration, secs(3));
    }

    #[test]
    fn test_large_clock_jump_moves_one_phase_only() {
        let t0 = Instant::now();
        let mut ctl = SignalController::new(PhaseTimings::default(), t0);

        ctl.tick(t0 + secs(1_000), CongestionTier::Low);
        assert_eq!(ctl.state().phase, Phase::Yellow);
    }

    #[test]
    fn test_mid_phase_tier_change_does_not_truncate() {
        let t0 = Instant::now();
        let mut ctl = SignalController::new(PhaseTimings::default(), t0);

        // HIGH would give a 15 s green, but this green began under LOW.
        assert_eq!(ctl.tick(t0 + secs(16), CongestionTier::High), None);
        assert_eq!(ctl.tick(t0 + secs(29), CongestionTier::High), None);
        assert_eq!(ctl.state().phase_duration, secs(30));

        // The new tier applies from the next phase on.
        ctl.tick(t0 + secs(30), CongestionTier::High);
        ctl.tick(t0 + secs(33), CongestionTier::High);
        assert_eq!(ctl.state().phase, Phase::Red);
        assert_eq!(ctl.state().phase_duration, secs(35));
        assert_eq!(ctl.state().scheduled_tier, CongestionTier::High);
    }

    #[test]
    fn test_simulated_clock_walks_full_cycles() {
        let t0 = Instant::now();
        let mut ctl = SignalController::new(PhaseTimings::default(), t0);
        let step = Duration::from_millis(100);

        // Tier sequence: LOW for the first 40 s, HIGH afterwards.
        let tier_at = |t: Duration| {
            if t < secs(40) {
                CongestionTier::Low
            } else {
                CongestionTier::High
            }
        };

        let mut boundaries = Vec::new();
        let mut t = Duration::ZERO;
        while t <= secs(140) {
            let now = t0 + t;
            let before = ctl.state();
            if let Some(ended) = ctl.tick(now, tier_at(t)) {
                assert_eq!(ended, before.phase);
                assert!(before.elapsed(now) >= before.phase_duration);
                assert_eq!(ctl.state().phase, before.phase.next());
                boundaries.push((ctl.state().phase, ctl.state().phase_duration.as_secs(), t));
            }
            t += step;
        }

        let expected = vec![
            (Phase::Yellow, 3, secs(30)),
            (Phase::Red, 15, secs(33)),
            (Phase::Green, 15, secs(48)),
            (Phase::Yellow, 3, secs(63)),
            (Phase::Red, 35, secs(66)),
            (Phase::Green, 15, secs(101)),
            (Phase::Yellow, 3, secs(116)),
            (Phase::Red, 35, secs(119)),
        ];
        assert_eq!(boundaries, expected);
    }

    #[test]
    fn test_preview_does_not_mutate() {
        let t0 = Instant::now();
        let ctl = SignalController::new(PhaseTimings::default(), t0);

        let next = ctl.preview(t0 + secs(31), CongestionTier::Medium);
        assert_eq!(next.phase, Phase::Yellow);
        assert_eq!(ctl.state().phase, Phase::Green);
    }
}
