//! ==============================================================================
//! hal.rs - status indicator outputs
//! ==============================================================================
//!
//! purpose:
//!     every subsystem owns one status pin that goes high on enable and low on
//!     disable, plus a boot pin driven high at startup. this module abstracts
//!     the difference between a real Raspberry Pi (using `rppal`) and a
//!     development machine (using a recording mock).
//!
//! relationships:
//!     - used by: subsystem.rs (indicator on enable/disable), main.rs (boot pin)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

pub trait IndicatorProvider: Send + Sync {
    fn set_gpio_mode(&self, pin: u8, mode: &str) -> Result<()>;
    fn write_gpio(&self, pin: u8, level: bool) -> Result<()>;
    /// last level written to `pin`, if any
    fn level(&self, pin: u8) -> Option<bool>;
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build, and tests)
// ==============================================================================================
#[derive(Default)]
pub struct MockIndicators {
    levels: std::sync::Mutex<std::collections::HashMap<u8, bool>>,
}

impl MockIndicators {
    pub fn new() -> Self {
        tracing::info!("Using MOCK indicators (No hardware access)");
        Self::default()
    }
}

impl IndicatorProvider for MockIndicators {
    fn set_gpio_mode(&self, pin: u8, mode: &str) -> Result<()> {
        tracing::debug!("[MOCK GPIO] Pin {} set to {}", pin, mode);
        Ok(())
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        tracing::debug!("[MOCK GPIO] Pin {} write {}", pin, level);
        let mut levels = self
            .levels
            .lock()
            .map_err(|_| anyhow::anyhow!("indicator state poisoned"))?;
        levels.insert(pin, level);
        Ok(())
    }

    fn level(&self, pin: u8) -> Option<bool> {
        self.levels.lock().ok().and_then(|l| l.get(&pin).copied())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct GpioIndicators {
    gpio: rppal::gpio::Gpio,
    pins: std::sync::Mutex<std::collections::HashMap<u8, rppal::gpio::OutputPin>>,
}

#[cfg(feature = "hardware")]
impl GpioIndicators {
    pub fn new() -> Result<Self> {
        tracing::info!("Using REAL HARDWARE indicators (rppal)");
        Ok(Self {
            gpio: rppal::gpio::Gpio::new()?,
            pins: std::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }
}

#[cfg(feature = "hardware")]
impl IndicatorProvider for GpioIndicators {
    fn set_gpio_mode(&self, pin: u8, mode: &str) -> Result<()> {
        if mode != "output" {
            anyhow::bail!("indicator pin {} only supports output mode, got {}", pin, mode);
        }
        let mut pins = self
            .pins
            .lock()
            .map_err(|_| anyhow::anyhow!("indicator state poisoned"))?;
        if !pins.contains_key(&pin) {
            let mut p = self.gpio.get(pin)?.into_output();
            // keep the level after the handle goes away
            p.set_reset_on_drop(false);
            pins.insert(pin, p);
        }
        Ok(())
    }

    fn write_gpio(&self, pin: u8, level: bool) -> Result<()> {
        self.set_gpio_mode(pin, "output")?;
        let mut pins = self
            .pins
            .lock()
            .map_err(|_| anyhow::anyhow!("indicator state poisoned"))?;
        if let Some(p) = pins.get_mut(&pin) {
            if level {
                p.set_high();
            } else {
                p.set_low();
            }
        }
        Ok(())
    }

    fn level(&self, pin: u8) -> Option<bool> {
        let pins = self.pins.lock().ok()?;
        pins.get(&pin).map(|p| p.is_set_high())
    }
}

/// indicator backend for this build
pub fn default_indicators() -> Result<std::sync::Arc<dyn IndicatorProvider>> {
    #[cfg(feature = "hardware")]
    {
        Ok(std::sync::Arc::new(GpioIndicators::new()?))
    }
    #[cfg(not(feature = "hardware"))]
    {
        Ok(std::sync::Arc::new(MockIndicators::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_records_levels() {
        let hal = MockIndicators::new();
        assert_eq!(hal.level(15), None);
        hal.set_gpio_mode(15, "output").unwrap();
        hal.write_gpio(15, true).unwrap();
        assert_eq!(hal.level(15), Some(true));
        hal.write_gpio(15, false).unwrap();
        assert_eq!(hal.level(15), Some(false));
    }
}
