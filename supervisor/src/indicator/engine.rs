// Indicator Engine
// Free-running render task: snapshot the shared state every tick and drive three PWM channels

use anyhow::Result;
use embassy_time::{Duration, Ticker};
use log::{info, warn};

use super::{Color, Indicator, IndicatorState};
use crate::config::SupervisorConfig;

/// Three independent duty-cycle outputs (red, green, blue)
pub trait PwmOutputs {
    fn max_duty(&self) -> u32;
    fn set_duties(&mut self, duties: [u32; 3]) -> Result<()>;
}

/// Per-state animation position. Restarts whenever the displayed state changes.
#[derive(Debug)]
pub struct Waveform {
    max_duty: u32,
    ticks_per_half_period: u32,
    pulse_step: u32,
    current: Option<IndicatorState>,
    tick: u32,
    flash_on: bool,
    level: u32,
    rising: bool,
}

impl Waveform {
    pub fn new(max_duty: u32, ticks_per_half_period: u32, pulse_step_permille: u32) -> Self {
        let pulse_step = (max_duty as u64 * pulse_step_permille as u64 / 1000).max(1) as u32;
        Self {
            max_duty,
            ticks_per_half_period: ticks_per_half_period.max(1),
            pulse_step,
            current: None,
            tick: 0,
            flash_on: true,
            level: 0,
            rising: true,
        }
    }

    pub fn from_config(config: &SupervisorConfig, max_duty: u32) -> Self {
        let ticks = config.flash_half_period_ms / config.indicator_period_ms.max(1);
        Self::new(max_duty, ticks as u32, config.pulse_step_permille)
    }

    /// Duties for the next tick of `state`
    pub fn next_frame(&mut self, state: IndicatorState) -> [u32; 3] {
        if self.current != Some(state) {
            self.current = Some(state);
            self.tick = 0;
            self.flash_on = true;
            self.level = 0;
            self.rising = true;
        }

        match state {
            IndicatorState::Off => [0; 3],
            IndicatorState::Solid(color) => scale(color, self.max_duty),
            IndicatorState::Flashing(color) => {
                let frame = if self.flash_on {
                    scale(color, self.max_duty)
                } else {
                    [0; 3]
                };
                self.tick += 1;
                if self.tick >= self.ticks_per_half_period {
                    self.tick = 0;
                    self.flash_on = !self.flash_on;
                }
                frame
            }
            IndicatorState::Pulsating(color) => {
                let frame = scale(color, self.level);
                if self.rising {
                    self.level = (self.level + self.pulse_step).min(self.max_duty);
                    if self.level == self.max_duty {
                        self.rising = false;
                    }
                } else {
                    self.level = self.level.saturating_sub(self.pulse_step);
                    if self.level == 0 {
                        self.rising = true;
                    }
                }
                frame
            }
        }
    }
}

fn scale(color: Color, brightness: u32) -> [u32; 3] {
    color
        .rgb()
        .map(|channel| (brightness as u64 * channel as u64 / 255) as u32)
}

pub struct IndicatorEngine<P: PwmOutputs> {
    outputs: P,
    waveform: Waveform,
    period: Duration,
    output_failing: bool,
}

impl<P: PwmOutputs> IndicatorEngine<P> {
    pub fn new(outputs: P, config: &SupervisorConfig) -> Self {
        let max_duty = outputs.max_duty().min(config.pwm_max_duty);
        Self {
            waveform: Waveform::from_config(config, max_duty),
            outputs,
            period: config.indicator_period(),
            output_failing: false,
        }
    }

    /// Render a single frame from the current shared state
    pub fn render_once(&mut self, indicator: &Indicator) {
        let duties = self.waveform.next_frame(indicator.current());
        match self.outputs.set_duties(duties) {
            Ok(()) => {
                if self.output_failing {
                    info!("💡 Indicator output recovered");
                    self.output_failing = false;
                }
            }
            Err(e) => {
                // log once per failure streak, the render loop runs every tick
                if !self.output_failing {
                    warn!("⚠️ Failed to set indicator duty: {}", e);
                    self.output_failing = true;
                }
            }
        }
    }

    pub async fn run(&mut self, indicator: &Indicator) -> ! {
        info!("💡 Indicator engine started ({} ms period)", self.period.as_millis());
        let mut ticker = Ticker::every(self.period);
        loop {
            self.render_once(indicator);
            ticker.next().await;
        }
    }

    pub fn outputs(&self) -> &P {
        &self.outputs
    }
}
