use anyhow::Result;
use esp_idf_svc::hal::gpio::OutputPin;
use esp_idf_svc::hal::ledc::config::TimerConfig;
use esp_idf_svc::hal::ledc::{LedcChannel, LedcDriver, LedcTimer, LedcTimerDriver, Resolution};
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::prelude::*;
use log::info;

use coop_supervisor::PwmOutputs;

/// Three LEDC channels sharing one 5 kHz, 13-bit timer (duty 0..=8191)
pub struct LedOutputs {
    red: LedcDriver<'static>,
    green: LedcDriver<'static>,
    blue: LedcDriver<'static>,
}

impl LedOutputs {
    #[allow(clippy::too_many_arguments)]
    pub fn new<T: LedcTimer + 'static>(
        timer: impl Peripheral<P = T> + 'static,
        red_channel: impl Peripheral<P = impl LedcChannel<SpeedMode = T::SpeedMode>> + 'static,
        red_pin: impl Peripheral<P = impl OutputPin> + 'static,
        green_channel: impl Peripheral<P = impl LedcChannel<SpeedMode = T::SpeedMode>> + 'static,
        green_pin: impl Peripheral<P = impl OutputPin> + 'static,
        blue_channel: impl Peripheral<P = impl LedcChannel<SpeedMode = T::SpeedMode>> + 'static,
        blue_pin: impl Peripheral<P = impl OutputPin> + 'static,
    ) -> Result<Self> {
        let timer_config = TimerConfig::default()
            .frequency(5.kHz().into())
            .resolution(Resolution::Bits13);
        // The channels borrow the timer for the life of the firmware
        let timer: &'static LedcTimerDriver<'static, T> =
            Box::leak(Box::new(LedcTimerDriver::new(timer, &timer_config)?));

        let mut outputs = Self {
            red: LedcDriver::new(red_channel, timer, red_pin)?,
            green: LedcDriver::new(green_channel, timer, green_pin)?,
            blue: LedcDriver::new(blue_channel, timer, blue_pin)?,
        };
        outputs.set_duties([0, 0, 0])?;

        info!("💡 RGB indicator ready (max duty {})", outputs.max_duty());
        Ok(outputs)
    }
}

impl PwmOutputs for LedOutputs {
    fn max_duty(&self) -> u32 {
        self.red.get_max_duty()
    }

    fn set_duties(&mut self, duties: [u32; 3]) -> Result<()> {
        let [red, green, blue] = duties;
        self.red.set_duty(red)?;
        self.green.set_duty(green)?;
        self.blue.set_duty(blue)?;
        Ok(())
    }
}
