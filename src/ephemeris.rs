//! ==============================================================================
//! ephemeris.rs - day/night gate
//! ==============================================================================
//!
//! purpose:
//!     answers "is the sun below the configured altitude right now?" and
//!     "when does it next go below?" for the scheduler.
//!
//! model:
//!     low-precision solar position (good to ~0.01°, far below what a
//!     10° twilight gate needs): mean anomaly and longitude, ecliptic
//!     longitude with the two-term equation of centre, then equatorial
//!     coordinates and local hour angle. no refraction.
//!
//! ==============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::SiteConfig;

pub trait Ephemeris {
    fn is_night(&self, utc: DateTime<Utc>) -> bool;

    /// Next moment the sun drops to the gate altitude, if within two days.
    fn next_sunset(&self, utc: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

const J2000: f64 = 2_451_545.0;
const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const SEARCH_STEP_MINUTES: i64 = 5;
const SEARCH_HORIZON_HOURS: i64 = 48;

fn days_since_j2000(utc: DateTime<Utc>) -> f64 {
    let seconds = utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_millis()) / 1000.0;
    seconds / 86_400.0 + UNIX_EPOCH_JD - J2000
}

/// Sun altitude in degrees at `utc` for the given site.
pub fn sun_altitude(latitude: f64, longitude: f64, utc: DateTime<Utc>) -> f64 {
    let d = days_since_j2000(utc);

    let g = (357.529 + 0.985_600_28 * d).to_radians();
    let q = 280.459 + 0.985_647_36 * d;
    let lambda = (q + 1.915 * g.sin() + 0.020 * (2.0 * g).sin()).to_radians();
    let obliquity = (23.439 - 0.000_000_36 * d).to_radians();

    let right_ascension = (obliquity.cos() * lambda.sin()).atan2(lambda.cos());
    let declination = (obliquity.sin() * lambda.sin()).asin();

    let gmst_hours = (18.697_374_558 + 24.065_709_824_419_08 * d).rem_euclid(24.0);
    let hour_angle = (gmst_hours * 15.0 + longitude).to_radians() - right_ascension;

    let lat = latitude.to_radians();
    let sin_alt = lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos();
    sin_alt.clamp(-1.0, 1.0).asin().to_degrees()
}

pub struct SolarEphemeris {
    latitude: f64,
    longitude: f64,
    horizon: f64,
}

impl SolarEphemeris {
    pub fn new(site: &SiteConfig) -> Self {
        Self {
            latitude: site.latitude,
            longitude: site.longitude,
            horizon: site.horizon,
        }
    }

    fn above(&self, utc: DateTime<Utc>) -> bool {
        sun_altitude(self.latitude, self.longitude, utc) > self.horizon
    }
}

impl Ephemeris for SolarEphemeris {
    fn is_night(&self, utc: DateTime<Utc>) -> bool {
        !self.above(utc)
    }

    fn next_sunset(&self, utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let step = ChronoDuration::minutes(SEARCH_STEP_MINUTES);
        let end = utc + ChronoDuration::hours(SEARCH_HORIZON_HOURS);

        let mut before = utc;
        let mut was_above = self.above(before);
        while before < end {
            let after = before + step;
            let is_above = self.above(after);
            if was_above && !is_above {
                // bisect down to a second
                let (mut lo, mut hi) = (before, after);
                while hi - lo > ChronoDuration::seconds(1) {
                    let mid = lo + (hi - lo) / 2;
                    if self.above(mid) {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                return Some(hi);
            }
            before = after;
            was_above = is_above;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    fn equator(horizon: f64) -> SolarEphemeris {
        SolarEphemeris::new(&SiteConfig {
            name: "EQ".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0.0,
            horizon,
        })
    }

    #[test]
    fn equinox_sun_at_the_equator() {
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();
        assert!(sun_altitude(0.0, 0.0, noon) > 85.0);
        assert!(sun_altitude(0.0, 0.0, midnight) < -85.0);

        let gate = equator(10.0);
        assert!(!gate.is_night(noon));
        assert!(gate.is_night(midnight));
    }

    #[test]
    fn sunset_is_found_in_the_evening() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 20, 9, 0, 0).unwrap();
        let sunset = equator(0.0).next_sunset(morning).unwrap();
        assert_eq!(sunset.date_naive(), morning.date_naive());
        let minutes = sunset.hour() * 60 + sunset.minute();
        assert!((17 * 60 + 50..18 * 60 + 25).contains(&minutes), "{sunset}");
    }

    #[test]
    fn higher_gate_closes_earlier() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 20, 9, 0, 0).unwrap();
        let at_horizon = equator(0.0).next_sunset(morning).unwrap();
        let at_ten = equator(10.0).next_sunset(morning).unwrap();
        // ~4 minutes per degree at the equator
        let gap = (at_horizon - at_ten).num_minutes();
        assert!((35..45).contains(&gap), "{gap}");
    }

    #[test]
    fn polar_night_has_no_sunset() {
        let pole = SolarEphemeris::new(&SiteConfig {
            name: "POLE".to_string(),
            latitude: 89.0,
            longitude: 0.0,
            altitude: 0.0,
            horizon: 10.0,
        });
        let december = Utc.with_ymd_and_hms(2024, 12, 21, 12, 0, 0).unwrap();
        assert!(pole.is_night(december));
        assert_eq!(pole.next_sunset(december), None);
    }
}
