//! ==============================================================================
//! sensors.rs - gateway's own sensor bank
//! ==============================================================================
//!
//! purpose:
//!     the gateway carries the same probes as a field node: air temperature and
//!     humidity, a soil probe and a gas sensor. the drivers are external; this
//!     module holds the SensorBank boundary and the unit conversions that turn
//!     raw adc counts into the values that go on the wire.
//!
//! implementations:
//!     - SimulatedSensors: deterministic slowly-varying values, with a warm-up
//!       period during which every channel reads zero.
//!
//! ==============================================================================

use anyhow::Result;
use std::sync::Mutex;

use crate::domain::ChannelValues;

pub const ADC_MAX: f64 = 4095.0;
pub const VREF_MV: f64 = 3300.0;
pub const VREF_V: f64 = 3.3;

/// soil probe output range, in millivolts
pub const SOIL_MIN_MV: f64 = 19.0;
pub const SOIL_MAX_MV: f64 = 110.0;

/// gas sensor load resistor
pub const GAS_LOAD_OHMS: f64 = 10_000.0;
pub const GAS_R0_DEFAULT: f64 = 30_000.0;
const GAS_R0_MIN: f64 = 1_000.0;
const GAS_R0_MAX: f64 = 100_000.0;
const RS_CLEAN_AIR: f64 = 30_000.0;
const RS_VERY_BAD: f64 = 2_000.0;

pub trait SensorBank: Send + Sync + 'static {
    /// power the probes and start their sampling
    fn power_up(&self) -> Result<()>;

    /// latest converted value of every channel. zero means "no data yet".
    fn read(&self) -> ChannelValues;

    fn power_down(&self);
}

// ==============================================================================
// conversions
// ==============================================================================

pub fn adc_to_millivolts(raw: u16) -> f64 {
    (raw as f64 / ADC_MAX) * VREF_MV
}

/// soil probe millivolts to percent, clamped to the probe's range
pub fn soil_percent(mv: f64) -> f64 {
    let mv = mv.clamp(SOIL_MIN_MV, SOIL_MAX_MV);
    (mv - SOIL_MIN_MV) * (100.0 / (SOIL_MAX_MV - SOIL_MIN_MV))
}

/// gas sensor resistance from its divider voltage
pub fn gas_resistance(volts: f64) -> f64 {
    let volts = volts.max(0.01);
    (VREF_V / volts - 1.0) * GAS_LOAD_OHMS
}

/// coarse air quality index, 0 (clean) to 500 (very bad)
pub fn air_quality_index(rs: f64) -> u16 {
    let rs = rs.clamp(RS_VERY_BAD, RS_CLEAN_AIR);
    let ratio = (RS_CLEAN_AIR - rs) / (RS_CLEAN_AIR - RS_VERY_BAD);
    (ratio * 500.0).clamp(0.0, 500.0) as u16
}

/// mean of the calibration samples, or the default when it is implausible
pub fn calibrate_r0(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return GAS_R0_DEFAULT;
    }
    let estimate = samples.iter().sum::<f64>() / samples.len() as f64;
    if !(GAS_R0_MIN..=GAS_R0_MAX).contains(&estimate) {
        tracing::warn!(estimate, fallback = GAS_R0_DEFAULT, "gas r0 calibration out of range");
        return GAS_R0_DEFAULT;
    }
    estimate
}

/// gas concentration estimate from the sensor's rs/r0 curve
pub fn gas_ppm(rs: f64, r0: f64) -> f64 {
    let ratio = (rs.max(1.0) / r0).clamp(0.01, 10.0);
    (116.602_068_2 * ratio.powf(-2.769_034_857)).clamp(0.0, 50_000.0)
}

// ==============================================================================
// simulated bank
// ==============================================================================

const CALIBRATION_SAMPLES: usize = 5;

#[derive(Default)]
struct SimState {
    powered: bool,
    reads: u32,
    r0: Option<f64>,
}

pub struct SimulatedSensors {
    warmup_reads: u32,
    state: Mutex<SimState>,
}

impl SimulatedSensors {
    /// `warmup_reads` reads after power-up return all zeros
    pub fn new(warmup_reads: u32) -> Self {
        Self {
            warmup_reads,
            state: Mutex::new(SimState::default()),
        }
    }

    fn soil_raw(tick: u32) -> u16 {
        80 + (tick % 20) as u16
    }

    fn gas_raw(tick: u32) -> u16 {
        1241 + (tick % 7) as u16 * 3
    }
}

impl SensorBank for SimulatedSensors {
    fn power_up(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("sensor state poisoned"))?;
        state.powered = true;
        state.reads = 0;
        tracing::info!("sensor bank powered");
        Ok(())
    }

    fn read(&self) -> ChannelValues {
        let Ok(mut state) = self.state.lock() else {
            return ChannelValues::default();
        };
        if !state.powered {
            return ChannelValues::default();
        }
        state.reads += 1;
        if state.reads <= self.warmup_reads {
            return ChannelValues::default();
        }

        let tick = state.reads;
        let r0 = *state.r0.get_or_insert_with(|| {
            let samples: Vec<f64> = (0..CALIBRATION_SAMPLES as u32)
                .map(|i| gas_resistance(adc_to_millivolts(Self::gas_raw(i)) / 1000.0))
                .collect();
            calibrate_r0(&samples)
        });

        let phase = tick as f64 * 0.3;
        let rs = gas_resistance(adc_to_millivolts(Self::gas_raw(tick)) / 1000.0);
        ChannelValues {
            temperature: 22.0 + 0.5 * phase.sin(),
            air_humidity: 55.0 + 3.0 * phase.cos(),
            soil_moisture: soil_percent(adc_to_millivolts(Self::soil_raw(tick))),
            particulates: gas_ppm(rs, r0),
        }
    }

    fn power_down(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.powered {
                tracing::info!("sensor bank powered down");
            }
            state.powered = false;
        }
    }
}
