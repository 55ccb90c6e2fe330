use anyhow::Context;
use esp_idf_hal::gpio::{
    AnyIOPin, AnyOutputPin, Input, InterruptType, Level, Output, PinDriver, Pull,
};
use log::{info, warn};

use fence_common::{
    config::HOLD_THRESHOLD_MS, ActiveLevel, HoldDetector, OutputError, Relay, RelayOutputs,
    TargetProfile,
};

/// Written only by the GPIO interrupt and read by the main loop.
pub static RESET_BUTTON: HoldDetector = HoldDetector::new(HOLD_THRESHOLD_MS);

pub struct BoardRelays {
    fence: PinDriver<'static, AnyOutputPin, Output>,
    siren: PinDriver<'static, AnyOutputPin, Output>,
    active: ActiveLevel,
}

impl BoardRelays {
    pub fn new(profile: &TargetProfile) -> anyhow::Result<Self> {
        let fence = unsafe { PinDriver::output(AnyOutputPin::new(profile.fence_pin)) }
            .with_context(|| format!("fence relay unavailable on GPIO{}", profile.fence_pin))?;
        let siren = unsafe { PinDriver::output(AnyOutputPin::new(profile.siren_pin)) }
            .with_context(|| format!("siren relay unavailable on GPIO{}", profile.siren_pin))?;
        info!(
            "relays on GPIO{} (fence) / GPIO{} (siren), active {:?}",
            profile.fence_pin, profile.siren_pin, profile.relay_active
        );
        Ok(Self {
            fence,
            siren,
            active: profile.relay_active,
        })
    }
}

impl RelayOutputs for BoardRelays {
    fn drive(&mut self, relay: Relay, on: bool) -> Result<(), OutputError> {
        let level = if self.active.pin_high(on) {
            Level::High
        } else {
            Level::Low
        };
        let pin = match relay {
            Relay::Fence => &mut self.fence,
            Relay::Siren => &mut self.siren,
        };
        pin.set_level(level).map_err(|err| OutputError {
            relay: relay.as_str(),
            message: err.to_string(),
        })
    }
}

/// Active-low reset button with an internal pull-up.
pub struct ResetButton {
    pin: PinDriver<'static, AnyIOPin, Input>,
}

impl ResetButton {
    pub fn new(gpio: i32) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(unsafe { AnyIOPin::new(gpio) })
            .with_context(|| format!("reset button unavailable on GPIO{gpio}"))?;
        pin.set_pull(Pull::Up)?;
        pin.set_interrupt_type(InterruptType::AnyEdge)?;

        // Interrupt context: read the level and clock, store two atomics, nothing else.
        unsafe {
            pin.subscribe(move || {
                let pressed = esp_idf_svc::sys::gpio_get_level(gpio) == 0;
                RESET_BUTTON.on_edge(pressed, millis());
            })?;
        }
        pin.enable_interrupt()?;
        info!("reset button armed on GPIO{gpio}");
        Ok(Self { pin })
    }

    /// Re-arms the edge interrupt, which the HAL disables after each delivery,
    /// and feeds the sampled level to the detector.
    pub fn service(&mut self) {
        if let Err(err) = self.pin.enable_interrupt() {
            warn!("failed to re-arm reset button interrupt: {err}");
        }
        RESET_BUTTON.sync_level(self.pin.is_low(), millis());
    }
}

/// Wrapping millisecond clock shared by the interrupt and the main loop.
pub fn millis() -> u32 {
    (unsafe { esp_idf_svc::sys::esp_timer_get_time() } / 1_000) as u32
}
