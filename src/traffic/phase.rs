/*
 * Passive records for the scheduler: one schedulable movement and the
 * demand sources bound to it. All decisions live in the parent module;
 * what lives here is the bookkeeping the decisions are made over.
 */

use embassy_time::{Duration, Instant};

use crate::light::Color;
use crate::light_registry::LightId;

/// Index of a phase in its [`System`](crate::System). Doubles as the bit
/// position of the phase in every exclusivity bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseId(pub(crate) usize);

impl PhaseId {
    pub const fn index(self) -> usize {
        self.0
    }

    /// This phase's bit, for composing exclusivity masks.
    pub const fn mask(self) -> u32 {
        1 << self.0
    }
}

/// Handle to a demand source registered with
/// [`System::add_detector`](crate::System::add_detector).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DetectorId(pub(crate) usize);

/// What to do with a notification for a phase that is already being
/// served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NotifyPolicy {
    /// Drop it; traffic on a green is not waiting.
    IgnoreWhileGreen,
    /// Record it like any other arrival.
    AlwaysRecord,
}

/// A demand source bound to one phase. The binding is by index, so a
/// detector can never outlive or dangle across a reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detector {
    pub(crate) phase: PhaseId,
    // Estimated travel time from the sensor to the stop line. Zero means
    // the arrival is immediate.
    pub(crate) distance: Duration,
}

impl Detector {
    pub fn phase(&self) -> PhaseId {
        self.phase
    }

    pub fn distance(&self) -> Duration {
        self.distance
    }
}

/// One schedulable traffic movement: a signal head, the set of movements
/// it can never share a green with, and its timing state.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub name: &'static str,
    pub light: LightId,
    /// Bit *i* set: this phase cannot be green together with phase *i*.
    pub exclusive: u32,
    /// Positive demand weight. Defaults to 1.
    pub priority: f32,
    /// Minimum time this phase stays green once served.
    pub on_time: Duration,
    /// Time traffic needs to clear this movement after its green ends.
    pub clear_time: Duration,

    pub(crate) color: Color,
    pub(crate) waiting_since: Option<Instant>,
    pub(crate) on_since: Option<Instant>,
}

impl Phase {
    pub const fn new(name: &'static str, light: LightId) -> Self {
        Phase {
            name,
            light,
            exclusive: 0,
            priority: 1.0,
            on_time: Duration::from_ticks(0),
            clear_time: Duration::from_ticks(0),
            color: Color::Off,
            waiting_since: None,
            on_since: None,
        }
    }

    /// The color the scheduler currently commands for this movement.
    pub fn color(&self) -> Color {
        self.color
    }

    /// Earliest predicted unserved arrival, if any.
    pub fn waiting_since(&self) -> Option<Instant> {
        self.waiting_since
    }

    /// When this phase last turned green, while it is green.
    pub fn on_since(&self) -> Option<Instant> {
        self.on_since
    }

    // Record a predicted arrival. The earliest outstanding arrival wins;
    // a later report never delays demand that is already on the books.
    pub(crate) fn note_arrival(&mut self, candidate: Instant) {
        match self.waiting_since {
            Some(existing) if existing <= candidate => {}
            _ => self.waiting_since = Some(candidate),
        }
    }

    // Demand grows linearly with wait time, scaled by priority, so even a
    // low-priority movement eventually outbids anything.
    pub(crate) fn demand_score(&self, now: Instant) -> f32 {
        match self.waiting_since {
            Some(since) if now > since => (now - since).as_millis() as f32 * self.priority,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(t: u64) -> Instant {
        Instant::from_millis(t)
    }

    #[test]
    fn earliest_arrival_wins() {
        let mut phase = Phase::new("test", LightId(0));
        phase.note_arrival(ms(100));
        assert_eq!(phase.waiting_since(), Some(ms(100)));
        phase.note_arrival(ms(50));
        assert_eq!(phase.waiting_since(), Some(ms(50)));
        phase.note_arrival(ms(80));
        assert_eq!(phase.waiting_since(), Some(ms(50)));
    }

    #[test]
    fn demand_score_scales_with_wait_and_priority() {
        let mut phase = Phase::new("test", LightId(0));
        assert_eq!(phase.demand_score(ms(500)), 0.0);

        phase.note_arrival(ms(100));
        assert_eq!(phase.demand_score(ms(600)), 500.0);

        phase.priority = 2.0;
        assert_eq!(phase.demand_score(ms(600)), 1000.0);
    }

    #[test]
    fn predicted_arrivals_score_nothing_until_they_happen() {
        let mut phase = Phase::new("test", LightId(0));
        phase.note_arrival(ms(1000));
        assert_eq!(phase.demand_score(ms(400)), 0.0);
        assert_eq!(phase.demand_score(ms(1000)), 0.0);
        assert_eq!(phase.demand_score(ms(1250)), 250.0);
    }
}
