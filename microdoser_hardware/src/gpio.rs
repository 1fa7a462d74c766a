//! rppal-backed GPIO pins.

use microdoser_traits::{EnableInput, Output};
use rppal::gpio::{Gpio, InputPin, OutputPin};

use crate::error::Result;

/// Pump driver on a GPIO line.
pub struct GpioOutput {
    pin: OutputPin,
    active_low: bool,
}

impl GpioOutput {
    pub fn new(pin: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(pin)?.into_output();
        // Leave the pump off when the process exits.
        pin.set_reset_on_drop(true);
        let mut out = Self { pin, active_low };
        out.write(false);
        Ok(out)
    }

    fn write(&mut self, on: bool) {
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

impl Output for GpioOutput {
    fn turn_on(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write(true);
        tracing::debug!(pin = self.pin.pin(), "gpio output on");
        Ok(())
    }

    fn turn_off(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write(false);
        tracing::debug!(pin = self.pin.pin(), "gpio output off");
        Ok(())
    }
}

/// Enable switch wired to a GPIO input with pull-up.
pub struct GpioEnableInput {
    pin: InputPin,
    active_low: bool,
}

impl GpioEnableInput {
    pub fn new(pin: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(pin)?.into_input_pullup();
        Ok(Self { pin, active_low })
    }
}

impl EnableInput for GpioEnableInput {
    fn is_enabled(&self) -> bool {
        self.pin.is_high() != self.active_low
    }
}
