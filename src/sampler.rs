//! ==============================================================================
//! sampler.rs - averaged readings from bursts of raw frames
//! ==============================================================================
//!
//! purpose:
//!     one reading = N data frames taken at a steady cadence, outliers
//!     removed per quantity, brightness averaged in linear flux.
//!
//! relationships:
//!     - reads frames through: protocol.rs (DeviceSession)
//!     - produces: reading.rs (Reading) for the scheduler
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{remaining_pause, Clock};
use crate::config::SamplingConfig;
use crate::error::DeviceError;
use crate::protocol::DeviceSession;
use crate::reading::{LocalTime, Reading};
use crate::transport::Transport;

const MIN_PAUSE: Duration = Duration::from_secs(1);

/// Hard cap on the clip window as a fraction of the median.
const MAX_RELATIVE_DEVIATION: f64 = 0.2;

pub fn magnitude_to_flux(magnitude: f64) -> f64 {
    10f64.powf(-0.4 * magnitude)
}

pub fn flux_to_magnitude(flux: f64) -> f64 {
    -2.5 * flux.log10()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn population_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Mean of the values within `min(20% of |median|, sigma * std)` of the
/// median. Falls back to the median when everything is clipped.
pub fn filtered_mean(values: &[f64], sigma: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let median = median(values);
    let clip = (MAX_RELATIVE_DEVIATION * median.abs()).min(sigma * population_std(values));

    let kept: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| (v - median).abs() <= clip)
        .collect();

    if kept.is_empty() {
        warn!("[SAMPLER] High dispersion in the last reads, using the median");
        return Some(median);
    }
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

pub struct Sampler {
    measures: usize,
    pause: Duration,
    sigma: f64,
    local_time: LocalTime,
    clock: Arc<dyn Clock>,
}

impl Sampler {
    pub fn new(sampling: &SamplingConfig, local_time: LocalTime, clock: Arc<dyn Clock>) -> Self {
        Self {
            measures: sampling.measures_to_average.max(1),
            pause: sampling.pause_between_reads(),
            sigma: sampling.sigma,
            local_time,
            clock,
        }
    }

    /// Take one averaged reading. Any frame that exhausts its retries
    /// aborts the whole cycle.
    pub fn sample<T: Transport>(&self, session: &mut DeviceSession<T>) -> Result<Reading, DeviceError> {
        let mut temperature = Vec::with_capacity(self.measures);
        let mut frequency = Vec::with_capacity(self.measures);
        let mut ticks = Vec::with_capacity(self.measures);
        let mut flux = Vec::with_capacity(self.measures);

        let started = self.clock.now();
        for i in 0..self.measures {
            let read_started = self.clock.now();
            let frame = session.read_data()?;
            debug!(
                "[SAMPLER] read {}/{}: {:.2} mag, {:.1} C",
                i + 1,
                self.measures,
                frame.magnitude,
                frame.temperature
            );

            temperature.push(frame.temperature);
            frequency.push(frame.frequency);
            ticks.push(frame.ticks);
            flux.push(magnitude_to_flux(frame.magnitude));

            if i + 1 < self.measures {
                let elapsed = self.clock.elapsed_since(read_started);
                self.clock.sleep(remaining_pause(self.pause, elapsed, MIN_PAUSE));
            }
        }
        let finished = self.clock.now();
        let utc = started + (finished - started) / 2;

        let mean = |values: &[f64]| filtered_mean(values, self.sigma).unwrap_or(f64::NAN);
        Ok(Reading {
            utc,
            local: self.local_time.to_local(utc),
            temperature: mean(&temperature),
            frequency: mean(&frequency),
            ticks: mean(&ticks),
            sky_brightness: flux_to_magnitude(mean(&flux)),
        })
    }
}
