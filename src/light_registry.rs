/*
 * The set of registered signal heads, shared between the scheduler and the
 * renderer.
 *
 * Both registration and a full render pass happen inside one mutex region,
 * so a light is never read mid-update and a late registration never races
 * a render pass. The commanded color of every head crosses execution
 * contexts only through this mutex; the scheduler's own state is
 * single-context and needs no further guarding.
 *
 * Lock acquisition is bounded. A renderer that cannot get the lock within
 * the bound would keep stale output on the signal heads, and stale signal
 * output is a safety hazard, so the timeout aborts the process instead of
 * degrading.
 */

use embassy_sync::{
    blocking_mutex::raw::RawMutex,
    mutex::{Mutex, MutexGuard},
};
use embassy_time::{Duration, Instant, Ticker, with_timeout};
use heapless::Vec;

use crate::io::OutputSink;
use crate::light::{Color, Light};

const LOCK_TIMEOUT: Duration = Duration::from_millis(50);
const BLINK_HALF_PERIOD: Duration = Duration::from_millis(250);
const RENDER_PERIOD: Duration = Duration::from_millis(10);

/// Handle to a registered light, handed out by [`LightRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LightId(pub(crate) usize);

#[derive(Debug, Clone, Copy)]
struct BlinkClock {
    last_toggle: Instant,
    on: bool,
}

impl BlinkClock {
    const fn new() -> Self {
        BlinkClock {
            last_toggle: Instant::from_ticks(0),
            on: false,
        }
    }

    fn advance(&mut self, now: Instant) {
        if now > self.last_toggle + BLINK_HALF_PERIOD {
            self.last_toggle = now;
            self.on = !self.on;
        }
    }
}

/// The guarded interior: the registered heads plus the blink clock they
/// share. Obtained through [`LightRegistry::with_lights`].
pub struct Lights<const N: usize> {
    lights: Vec<Light, N>,
    blink: BlinkClock,
}

impl<const N: usize> Lights<N> {
    const fn new() -> Self {
        Lights {
            lights: Vec::new(),
            blink: BlinkClock::new(),
        }
    }

    fn register(&mut self, light: Light) -> Result<LightId, crate::ConfigError> {
        let id = LightId(self.lights.len());
        self.lights
            .push(light)
            .map_err(|_| crate::ConfigError::TooManyLights)?;
        debug!("registered light {}", id.0);
        Ok(id)
    }

    pub fn set_color(&mut self, id: LightId, color: Color) {
        if let Some(light) = self.lights.get_mut(id.0) {
            light.color = color;
        }
    }

    pub fn get(&self, id: LightId) -> Option<&Light> {
        self.lights.get(id.0)
    }

    fn render(&mut self, now: Instant, sink: &mut impl OutputSink) {
        self.blink.advance(now);
        for light in &mut self.lights {
            light.render(self.blink.on, sink);
        }
    }
}

pub struct LightRegistry<M: RawMutex, const N: usize> {
    inner: Mutex<M, Lights<N>>,
}

impl<M: RawMutex, const N: usize> LightRegistry<M, N> {
    pub const fn new() -> Self {
        LightRegistry {
            inner: Mutex::new(Lights::new()),
        }
    }

    async fn lock_or_abort(&self) -> MutexGuard<'_, M, Lights<N>> {
        match with_timeout(LOCK_TIMEOUT, self.inner.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                error!("light registry lock timeout");
                panic!("light registry lock timeout");
            }
        }
    }

    /// Add a head to the render pass. Startup-time only; the set is fixed
    /// once the control loop runs.
    pub async fn register(&self, light: Light) -> Result<LightId, crate::ConfigError> {
        self.lock_or_abort().await.register(light)
    }

    /// Run `f` with the registry locked. This is how the scheduler writes
    /// commanded colors without tearing a concurrent render pass.
    pub async fn with_lights<R>(&self, f: impl FnOnce(&mut Lights<N>) -> R) -> R {
        let mut lights = self.lock_or_abort().await;
        f(&mut lights)
    }

    /// One render tick: advance the blink clock and every head's output
    /// state, emitting channel writes into `sink`.
    pub async fn render_pass(&self, sink: &mut impl OutputSink, now: Instant) {
        self.lock_or_abort().await.render(now, sink);
    }

    /// The renderer activity. Ticks faster than the scheduler so fades and
    /// blinks stay smooth regardless of the scheduling cadence.
    pub async fn run(&self, sink: &mut impl OutputSink) -> ! {
        let mut ticker = Ticker::every(RENDER_PERIOD);
        loop {
            self.render_pass(sink, Instant::now()).await;
            ticker.next().await;
        }
    }
}

impl<M: RawMutex, const N: usize> Default for LightRegistry<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::OutputId;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingSink {
        levels: HashMap<usize, bool>,
    }

    impl OutputSink for RecordingSink {
        fn write_level(&mut self, output: OutputId, on: bool) {
            self.levels.insert(output.0, on);
        }

        fn write_duty(&mut self, _output: OutputId, _duty: u8) {}
    }

    fn head(base: usize) -> Light {
        Light::two_state(
            OutputId(base),
            Some(OutputId(base + 1)),
            OutputId(base + 2),
        )
    }

    #[test]
    fn registration_hands_out_sequential_ids() {
        let registry: LightRegistry<NoopRawMutex, 2> = LightRegistry::new();
        block_on(async {
            let a = registry.register(head(0)).await.unwrap();
            let b = registry.register(head(3)).await.unwrap();
            assert_ne!(a, b);
            assert_eq!(
                registry.register(head(6)).await,
                Err(crate::ConfigError::TooManyLights)
            );
        });
    }

    #[test]
    fn render_pass_reflects_commanded_colors() {
        let registry: LightRegistry<NoopRawMutex, 2> = LightRegistry::new();
        let mut sink = RecordingSink::default();
        block_on(async {
            let a = registry.register(head(0)).await.unwrap();
            let b = registry.register(head(3)).await.unwrap();
            registry
                .with_lights(|lights| {
                    lights.set_color(a, Color::Green);
                    lights.set_color(b, Color::Red);
                    assert_eq!(lights.get(a).unwrap().color, Color::Green);
                })
                .await;
            registry.render_pass(&mut sink, Instant::from_millis(0)).await;
        });
        assert_eq!(sink.levels[&2], true);
        assert_eq!(sink.levels[&0], false);
        assert_eq!(sink.levels[&3], true);
        assert_eq!(sink.levels[&5], false);
    }

    #[test]
    fn blink_clock_toggles_on_its_half_period() {
        let registry: LightRegistry<NoopRawMutex, 1> = LightRegistry::new();
        let mut sink = RecordingSink::default();
        block_on(async {
            let a = registry
                .register(Light::two_state(OutputId(0), None, OutputId(1)))
                .await
                .unwrap();
            registry
                .with_lights(|lights| lights.set_color(a, Color::Yellow))
                .await;

            registry.render_pass(&mut sink, Instant::from_millis(0)).await;
            assert_eq!(sink.levels[&1], false);

            registry.render_pass(&mut sink, Instant::from_millis(300)).await;
            assert_eq!(sink.levels[&1], true);

            registry.render_pass(&mut sink, Instant::from_millis(560)).await;
            assert_eq!(sink.levels[&1], false);
        });
    }
}
