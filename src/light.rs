/*
 * One signal head: the mapping from a commanded color to per-channel
 * output state, plus the two ways a head can be driven. Two-state heads
 * switch their channels hard and emulate a missing yellow by flashing
 * green on the shared blink clock. PWM heads chase each channel's target
 * with an exponential fade and emulate a missing yellow by blending red
 * and green into amber instead of blinking.
 */

use enum_ordinalize::Ordinalize;

use crate::io::{OutputId, OutputSink};

// Smoothing coefficient per render tick. One step moves each duty a fifth
// of the way to its target, so a full fade takes a couple dozen ticks.
const PWM_COEFF: f32 = 0.2;
const PWM_RES: u8 = 255;

// Amber approximated by simultaneous red and green at tuned ratios.
const EMU_RED_RATIO: f32 = 0.6;
const EMU_GREEN_RATIO: f32 = 1.0;

/// The commanded state of a signal head. This is the only channel through
/// which the scheduler talks to a light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Color {
    Off,
    Red,
    Yellow,
    Green,
}

#[derive(Ordinalize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Channel {
    Red,
    Yellow,
    Green,
}

impl Color {
    /// Per-channel boolean targets for this color, ordered red, yellow,
    /// green. Off asserts every channel, so a head that has gone dark is
    /// distinguishable from one with a failed bulb.
    pub fn channel_states(self) -> [bool; Channel::VARIANT_COUNT] {
        match self {
            Color::Off => [true, true, true],
            Color::Red => [true, false, false],
            Color::Yellow => [false, true, false],
            Color::Green => [false, false, true],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Drive {
    Level,
    Pwm { duty: [f32; Channel::VARIANT_COUNT] },
}

/// One physical signal head and its render state. Constructed once at
/// startup, bound to fixed output channels, then mutated by the renderer
/// every render tick and by the scheduler whenever `color` changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    red: OutputId,
    yellow: Option<OutputId>,
    green: OutputId,
    drive: Drive,
    active_low: bool,

    /// The color this head is commanded to show.
    pub color: Color,
    last_color: Color,
    targets: [bool; Channel::VARIANT_COUNT],
}

impl Light {
    /// A head whose channels are switched hard on and off.
    pub const fn two_state(red: OutputId, yellow: Option<OutputId>, green: OutputId) -> Self {
        Self::with_drive(red, yellow, green, Drive::Level)
    }

    /// A head whose channels fade between states.
    pub const fn pwm(red: OutputId, yellow: Option<OutputId>, green: OutputId) -> Self {
        Self::with_drive(red, yellow, green, Drive::Pwm { duty: [0.0; 3] })
    }

    const fn with_drive(
        red: OutputId,
        yellow: Option<OutputId>,
        green: OutputId,
        drive: Drive,
    ) -> Self {
        Light {
            red,
            yellow,
            green,
            drive,
            active_low: false,
            color: Color::Off,
            last_color: Color::Off,
            // Dark at boot; the Off mapping applies from the first edge on.
            targets: [false; Channel::VARIANT_COUNT],
        }
    }

    /// Invert all writes for heads that sink current instead of sourcing it.
    pub const fn active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    // Advance this head by one render tick and emit its channel states.
    pub(crate) fn render(&mut self, blink_on: bool, sink: &mut impl OutputSink) {
        if self.color != self.last_color {
            self.targets = self.color.channel_states();
            self.last_color = self.color;
        }

        match &mut self.drive {
            Drive::Level => {
                let red = self.targets[Channel::Red.ordinal()];
                let mut green = self.targets[Channel::Green.ordinal()];

                if self.yellow.is_none() && self.color == Color::Yellow {
                    // Flashing green stands in for the missing yellow.
                    green = blink_on;
                }

                sink.write_level(self.red, red != self.active_low);
                if let Some(yellow) = self.yellow {
                    let on = self.targets[Channel::Yellow.ordinal()];
                    sink.write_level(yellow, on != self.active_low);
                }
                sink.write_level(self.green, green != self.active_low);
            }

            Drive::Pwm { duty } => {
                for (channel, duty) in duty.iter_mut().enumerate() {
                    step_duty(duty, self.targets[channel]);
                }

                let red_duty = duty[Channel::Red.ordinal()];
                let yellow_duty = duty[Channel::Yellow.ordinal()];
                let green_duty = duty[Channel::Green.ordinal()];

                match self.yellow {
                    Some(yellow) => {
                        sink.write_duty(self.red, quantize(red_duty, self.active_low));
                        sink.write_duty(yellow, quantize(yellow_duty, self.active_low));
                        sink.write_duty(self.green, quantize(green_duty, self.active_low));
                    }
                    None => {
                        let red = red_duty + yellow_duty * EMU_RED_RATIO;
                        let green = green_duty + yellow_duty * EMU_GREEN_RATIO;
                        sink.write_duty(self.red, quantize(red, self.active_low));
                        sink.write_duty(self.green, quantize(green, self.active_low));
                    }
                }
            }
        }
    }
}

fn step_duty(duty: &mut f32, on: bool) {
    if on {
        *duty += (1.0 - *duty) * PWM_COEFF;
    } else {
        *duty *= 1.0 - PWM_COEFF;
    }
}

// Blended amber can overshoot full scale; the saturating float-to-int
// cast clamps it.
fn quantize(value: f32, active_low: bool) -> u8 {
    let value = if active_low { 1.0 - value } else { value };
    (value * PWM_RES as f32 + 0.5) as u8
}
