/*
 * The phase scheduler and its transition state machine.
 *
 * Every scheduler tick lands in exactly one of three states. With a
 * transition pending and its deadline due, the new phase set is committed
 * atomically: every head flips in the same tick, and this is the only
 * place a head ever turns green. With a transition pending but not yet
 * due, the phases leaving the active set walk through their clearance
 * colors, yellow for the first half of the window and red for the second,
 * while the phases about to be served stay red until the commit. With
 * nothing pending, demand is aggregated into a new target set: active
 * phases inside their minimum green are kept unconditionally, then
 * waiting phases are admitted greedily by priority-weighted wait time
 * wherever the exclusivity masks allow, then compatible active phases are
 * re-admitted so a movement is never dropped for nothing.
 *
 * The transition window is sized to the slowest-clearing movement being
 * removed: one clearance interval of yellow, one more of all-red, before
 * anything conflicting is allowed on.
 */

mod phase;
pub use phase::*;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant, Ticker};
use heapless::Vec;

use crate::ConfigError;
use crate::io::{InputSource, SensorBinding, poll_sensors};
use crate::light::Color;
use crate::light_registry::{LightRegistry, Lights};

/// Phase capacity, bounded by the width of the exclusivity bitmaps.
pub const MAX_PHASES: usize = 32;
const MAX_DETECTORS: usize = 32;

const fn bit(index: usize) -> u32 {
    1 << index
}

#[derive(Debug, Clone, Copy)]
struct Change {
    target: u32,
    at: Instant,
}

/// The ordered phase set and the scheduling state machine over it.
pub struct System {
    phases: Vec<Phase, MAX_PHASES>,
    detectors: Vec<Detector, MAX_DETECTORS>,
    current: u32,
    pending: Option<Change>,
    pub notify_policy: NotifyPolicy,
}

impl System {
    pub const fn new() -> Self {
        System {
            phases: Vec::new(),
            detectors: Vec::new(),
            current: 0,
            pending: None,
            notify_policy: NotifyPolicy::IgnoreWhileGreen,
        }
    }

    /// Append a phase. Its position in the list is its bit in every
    /// exclusivity bitmap, fixed for the life of the system.
    pub fn add_phase(&mut self, phase: Phase) -> Result<PhaseId, ConfigError> {
        let id = PhaseId(self.phases.len());
        debug!("adding phase {} as index {}", phase.name, id.0);
        self.phases
            .push(phase)
            .map_err(|_| ConfigError::TooManyPhases)?;
        Ok(id)
    }

    /// Bind a demand source to a phase. Idempotent: re-registering an
    /// identical binding hands back the existing detector.
    pub fn add_detector(
        &mut self,
        phase: PhaseId,
        distance: Duration,
    ) -> Result<DetectorId, ConfigError> {
        if phase.0 >= self.phases.len() {
            return Err(ConfigError::UnknownPhase);
        }

        let detector = Detector { phase, distance };
        if let Some(existing) = self.detectors.iter().position(|d| *d == detector) {
            return Ok(DetectorId(existing));
        }

        let id = DetectorId(self.detectors.len());
        self.detectors
            .push(detector)
            .map_err(|_| ConfigError::TooManyDetectors)?;
        Ok(id)
    }

    /// Cross-field configuration checks, run once before the control loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let known_bits = if self.phases.len() >= MAX_PHASES {
            u32::MAX
        } else {
            bit(self.phases.len()) - 1
        };

        for phase in &self.phases {
            if !(phase.priority.is_finite() && phase.priority > 0.0) {
                warn!("phase {} has a non-positive priority", phase.name);
                return Err(ConfigError::NonPositivePriority);
            }
            if phase.exclusive & !known_bits != 0 {
                warn!("phase {} excludes phases that do not exist", phase.name);
                return Err(ConfigError::ExclusiveMaskOutOfRange);
            }
        }
        Ok(())
    }

    /// Record an arrival seen by `detector`. Fire-and-forget; a
    /// notification can never fail and never delays demand already on the
    /// books.
    pub fn notify(&mut self, detector: DetectorId, now: Instant) {
        let Some(detector) = self.detectors.get(detector.0) else {
            return;
        };
        let phase = &mut self.phases[detector.phase.0];

        if self.notify_policy == NotifyPolicy::IgnoreWhileGreen && phase.color == Color::Green {
            return;
        }

        trace!("demand for phase {}", phase.name);
        phase.note_arrival(now + detector.distance);
    }

    /// One scheduler tick. Total: never fails, never blocks.
    pub fn update(&mut self, now: Instant) {
        match self.pending {
            Some(change) if change.at <= now => self.commit(change, now),
            Some(change) => self.clear_down(change, now),
            None => self.schedule(now),
        }
    }

    // The atomic flip to the pending phase set.
    fn commit(&mut self, change: Change, now: Instant) {
        for (index, phase) in self.phases.iter_mut().enumerate() {
            if change.target & bit(index) != 0 {
                phase.color = Color::Green;
                phase.waiting_since = None;
                phase.on_since = Some(now);
            } else {
                phase.color = Color::Red;
                phase.on_since = None;
            }
        }
        self.current = change.target;
        self.pending = None;
        info!("committed phase set {}", change.target);
    }

    // Walk the leaving phases through yellow and then red as the deadline
    // approaches. Each phase uses its own clearance interval, so a slow
    // pedestrian crossing can go red early while a fast lane is still
    // yellow.
    fn clear_down(&mut self, change: Change, now: Instant) {
        let left = change.at - now;
        for (index, phase) in self.phases.iter_mut().enumerate() {
            let leaving = self.current & bit(index) != 0 && change.target & bit(index) == 0;
            if !leaving {
                continue;
            }

            if left <= phase.clear_time {
                phase.color = Color::Red;
            } else if left <= phase.clear_time * 2 {
                phase.color = Color::Yellow;
            }
        }
    }

    // Build the next target set from recorded demand.
    fn schedule(&mut self, now: Instant) {
        let mut map: u32 = 0;

        // Movements inside their minimum green are not negotiable.
        for (index, phase) in self.phases.iter().enumerate() {
            if self.current & bit(index) == 0 {
                continue;
            }
            if let Some(on_since) = phase.on_since {
                if now < on_since + phase.on_time {
                    map |= bit(index);
                }
            }
        }

        // Admit the highest-scoring compatible movement until none is
        // left. Strictly-greater comparison over ascending indices keeps
        // the lowest index on a tie.
        loop {
            let mut found: Option<usize> = None;
            let mut best_score = 0.0_f32;
            for (index, phase) in self.phases.iter().enumerate() {
                if map & bit(index) != 0 || phase.exclusive & map != 0 {
                    continue;
                }
                let score = phase.demand_score(now);
                if score > best_score {
                    best_score = score;
                    found = Some(index);
                }
            }
            match found {
                Some(index) => map |= bit(index),
                None => break,
            }
        }

        // Keep whatever is already running and does not get in the way.
        for (index, phase) in self.phases.iter().enumerate() {
            if self.current & bit(index) != 0
                && map & bit(index) == 0
                && phase.exclusive & map == 0
            {
                map |= bit(index);
            }
        }

        if map == self.current {
            return;
        }

        // The window is two clearance intervals of the slowest movement
        // being removed: one of yellow, one of all-red.
        let removed = self.current & !map;
        let mut clearance = Duration::from_ticks(0);
        for (index, phase) in self.phases.iter().enumerate() {
            if removed & bit(index) != 0 && phase.clear_time > clearance {
                clearance = phase.clear_time;
            }
        }

        let at = now + clearance * 2;
        info!("scheduling phase set {} for {}", map, at.as_millis());
        self.pending = Some(Change { target: map, at });
    }

    /// Copy every phase's commanded color into its registered head.
    pub fn apply<const N: usize>(&self, lights: &mut Lights<N>) {
        for phase in &self.phases {
            lights.set_color(phase.light, phase.color);
        }
    }

    /// Bitmap of the phases currently commanded green.
    pub fn current_phases(&self) -> u32 {
        self.current
    }

    /// Bitmap of the pending target, or the current one when no
    /// transition is pending.
    pub fn next_phases(&self) -> u32 {
        self.pending.map_or(self.current, |change| change.target)
    }

    /// Deadline of the pending transition, if one is pending.
    pub fn change_at(&self) -> Option<Instant> {
        self.pending.map(|change| change.at)
    }

    pub fn phase(&self, id: PhaseId) -> &Phase {
        &self.phases[id.0]
    }

    /// Configuration-time access to a phase's tuning fields.
    pub fn phase_mut(&mut self, id: PhaseId) -> &mut Phase {
        &mut self.phases[id.0]
    }

    pub fn phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter()
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

/// The scheduler activity: poll demand, advance the state machine, push
/// the commanded colors into the shared registry. The period is the
/// scheduling cadence; the renderer runs on its own, faster clock.
pub async fn run_intersection<M: RawMutex, const N: usize>(
    system: &mut System,
    registry: &LightRegistry<M, N>,
    sensors: &[SensorBinding],
    inputs: &mut impl InputSource,
    period: Duration,
) -> ! {
    if let Err(err) = system.validate() {
        error!("rejecting phase configuration: {}", err);
        panic!("invalid phase configuration");
    }

    let mut ticker = Ticker::every(period);
    loop {
        let now = Instant::now();
        system.update(now);
        registry.with_lights(|lights| system.apply(lights)).await;
        poll_sensors(system, sensors, inputs, now);
        ticker.next().await;
    }
}
