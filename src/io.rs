/*
 * The seam between the scheduler core and the device.
 *
 * Everything pin-shaped stays on the far side of the two traits in this
 * module. The firmware decides whether an `OutputId` is a GPIO, a PWM
 * channel or a position in a shift-register bit sequence; the core only
 * ever emits logical channel states. Likewise the core never reads a pin
 * itself: sensor levels are polled through `InputSource` once per
 * scheduler tick, with the electrical polarity recorded per binding.
 */

use embassy_futures::select::{Either, select};
use embassy_sync::{
    blocking_mutex::raw::RawMutex,
    channel::{Receiver, Sender},
};
use embassy_time::{Duration, Instant, Timer};

use crate::traffic::{DetectorId, System};

/// A logical output channel, mapped to hardware by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutputId(pub usize);

/// A logical digital input, mapped to hardware by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InputId(pub usize);

/// Where rendered channel states go. Writes are side-effect-only and
/// cannot fail; a sink that batches into a shift register simply latches
/// the bits on its next flush.
pub trait OutputSink {
    fn write_level(&mut self, output: OutputId, on: bool);
    fn write_duty(&mut self, output: OutputId, duty: u8);
}

/// Polled digital inputs. Returns the raw electrical level.
pub trait InputSource {
    fn read(&mut self, input: InputId) -> bool;
}

/// Binds one polled input to one detector.
#[derive(Debug, Clone, Copy)]
pub struct SensorBinding {
    pub input: InputId,
    pub detector: DetectorId,
    /// Inputs that read low when occupied, such as reed switches to ground.
    pub active_low: bool,
}

/// Reads every bound sensor once and notifies the detectors of the ones
/// that are occupied. Level-triggered: a held input notifies every tick,
/// which is harmless because earlier recorded demand always wins.
pub fn poll_sensors(
    system: &mut System,
    bindings: &[SensorBinding],
    source: &mut impl InputSource,
    now: Instant,
) {
    for binding in bindings {
        if source.read(binding.input) != binding.active_low {
            system.notify(binding.detector, now);
        }
    }
}

// Mechanical pushbuttons and reed switches chatter. Passing the raw edges
// straight into a detector is harmless for demand recording, since earlier
// demand wins anyway, but a bouncing input makes a miserable diagnostic
// trace. Inputs that arrive over a channel can be conditioned here: each
// raw value restarts the window, and only the value that survives a quiet
// window gets forwarded.
pub async fn debounce<'a, M: RawMutex, const N: usize>(
    input: Receiver<'a, M, bool, N>,
    output: Sender<'a, M, bool, N>,
    window: Duration,
) -> ! {
    loop {
        let mut value: bool = input.receive().await;

        'settle: loop {
            match select(input.receive(), Timer::after(window)).await {
                Either::First(new_value) => value = new_value,
                Either::Second(_) => break 'settle,
            }
        }

        output.send(value).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::channel::Channel;

    #[test]
    fn debounce_forwards_the_settled_value() {
        let raw: Channel<NoopRawMutex, bool, 4> = Channel::new();
        let clean: Channel<NoopRawMutex, bool, 4> = Channel::new();

        block_on(async {
            raw.send(true).await;
            raw.send(false).await;
            raw.send(true).await;

            let settled = select(
                debounce(raw.receiver(), clean.sender(), Duration::from_millis(5)),
                clean.receive(),
            )
            .await;

            match settled {
                Either::First(_) => unreachable!(),
                Either::Second(value) => assert!(value),
            }
        });
    }
}
