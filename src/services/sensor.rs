//! Sensor reading normalization
//!
//! Maps a spot's raw IoT reading (availability boolean, LED color, staleness)
//! to the tri-state occupancy signal the state machine consumes.
//!
//! Key behaviors:
//! - Explicit `is_available` wins when present; LED color is the fallback
//! - Missing or stale data yields `Unknown`, never `Vacant`
//! - The last LED color is remembered per spot so a color transition
//!   (blue->red = just parked, red->off/blue = just departed) is reported
//!   at most once

use crate::domain::types::{LedColor, Occupancy, SensorReading, SpotId};
use std::collections::HashMap;
use tracing::debug;

/// Readings older than this carry no information
pub const STALENESS_CUTOFF_SECS: u64 = 120;

/// A one-shot LED transition observed on a spot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotTransition {
    JustParked,
    JustDeparted,
}

impl SpotTransition {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotTransition::JustParked => "just_parked",
            SpotTransition::JustDeparted => "just_departed",
        }
    }
}

pub struct SensorReconciler {
    /// Last LED color seen per spot, for transition detection
    last_led: HashMap<SpotId, LedColor>,
    staleness_cutoff_secs: u64,
}

impl SensorReconciler {
    pub fn new(staleness_cutoff_secs: u64) -> Self {
        Self { last_led: HashMap::new(), staleness_cutoff_secs }
    }

    /// Normalize one spot's reading.
    ///
    /// Returns the occupancy signal plus an LED transition if one just
    /// occurred. A `None` reading touches nothing and yields `Unknown`.
    pub fn normalize(
        &mut self,
        spot: &SpotId,
        reading: Option<&SensorReading>,
    ) -> (Occupancy, Option<SpotTransition>) {
        let Some(reading) = reading else {
            return (Occupancy::Unknown, None);
        };

        if reading.age_secs.is_some_and(|age| age >= self.staleness_cutoff_secs) {
            debug!(
                spot = %spot,
                age_secs = ?reading.age_secs,
                "sensor_reading_stale"
            );
            return (Occupancy::Unknown, None);
        }

        let transition = self.detect_transition(spot, reading.led);

        let occupancy = match reading.is_available {
            Some(true) => Occupancy::Vacant,
            Some(false) => Occupancy::Occupied,
            // No boolean: fall back to the corroborating LED signal
            None => match reading.led {
                LedColor::Red => Occupancy::Occupied,
                LedColor::Blue | LedColor::Off => Occupancy::Vacant,
                LedColor::Unknown => Occupancy::Unknown,
            },
        };

        (occupancy, transition)
    }

    /// Compare against the remembered LED color and update the memory.
    ///
    /// Updating the memory on every observed color is what makes each
    /// transition fire exactly once.
    fn detect_transition(&mut self, spot: &SpotId, led: LedColor) -> Option<SpotTransition> {
        if led == LedColor::Unknown {
            return None;
        }

        let prev = self.last_led.insert(spot.clone(), led);

        let transition = match (prev, led) {
            (Some(LedColor::Blue), LedColor::Red) => Some(SpotTransition::JustParked),
            (Some(LedColor::Red), LedColor::Blue) | (Some(LedColor::Red), LedColor::Off) => {
                Some(SpotTransition::JustDeparted)
            }
            _ => None,
        };

        if let Some(t) = transition {
            debug!(spot = %spot, transition = %t.as_str(), "led_transition");
        }
        transition
    }

    /// Drop the remembered color for a spot (booking finished)
    pub fn forget_spot(&mut self, spot: &SpotId) {
        self.last_led.remove(spot);
    }
}

impl Default for SensorReconciler {
    fn default() -> Self {
        Self::new(STALENESS_CUTOFF_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot() -> SpotId {
        SpotId("A-1".to_string())
    }

    fn reading(is_available: Option<bool>, age_secs: Option<u64>, led: LedColor) -> SensorReading {
        SensorReading { spot: spot(), is_available, age_secs, led }
    }

    #[test]
    fn test_missing_reading_is_unknown() {
        let mut r = SensorReconciler::default();
        let (occ, transition) = r.normalize(&spot(), None);
        assert_eq!(occ, Occupancy::Unknown);
        assert!(transition.is_none());
    }

    #[test]
    fn test_stale_reading_is_unknown() {
        let mut r = SensorReconciler::new(120);
        let (occ, _) =
            r.normalize(&spot(), Some(&reading(Some(false), Some(120), LedColor::Red)));
        assert_eq!(occ, Occupancy::Unknown);

        // Just under the cutoff still counts
        let (occ, _) =
            r.normalize(&spot(), Some(&reading(Some(false), Some(119), LedColor::Red)));
        assert_eq!(occ, Occupancy::Occupied);
    }

    #[test]
    fn test_availability_boolean_preferred() {
        let mut r = SensorReconciler::default();

        let (occ, _) = r.normalize(&spot(), Some(&reading(Some(true), Some(1), LedColor::Red)));
        assert_eq!(occ, Occupancy::Vacant);

        let (occ, _) = r.normalize(&spot(), Some(&reading(Some(false), Some(1), LedColor::Blue)));
        assert_eq!(occ, Occupancy::Occupied);
    }

    #[test]
    fn test_led_fallback_without_boolean() {
        let mut r = SensorReconciler::default();

        let (occ, _) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Red)));
        assert_eq!(occ, Occupancy::Occupied);

        let (occ, _) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Blue)));
        assert_eq!(occ, Occupancy::Vacant);

        let (occ, _) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Off)));
        assert_eq!(occ, Occupancy::Vacant);

        let (occ, _) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Unknown)));
        assert_eq!(occ, Occupancy::Unknown);
    }

    #[test]
    fn test_parked_transition_reported_once() {
        let mut r = SensorReconciler::default();

        let (_, t) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Blue)));
        assert!(t.is_none());

        let (_, t) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Red)));
        assert_eq!(t, Some(SpotTransition::JustParked));

        // Same color again: no repeated transition
        let (_, t) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Red)));
        assert!(t.is_none());
    }

    #[test]
    fn test_departed_transition() {
        let mut r = SensorReconciler::default();
        r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Red)));

        let (_, t) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Off)));
        assert_eq!(t, Some(SpotTransition::JustDeparted));

        let (_, t) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Off)));
        assert!(t.is_none());
    }

    #[test]
    fn test_unknown_led_does_not_clobber_memory() {
        let mut r = SensorReconciler::default();
        r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Red)));

        // A dropout reading with no LED info must not erase the red memory
        r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Unknown)));

        let (_, t) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Blue)));
        assert_eq!(t, Some(SpotTransition::JustDeparted));
    }

    #[test]
    fn test_spots_tracked_independently() {
        let mut r = SensorReconciler::default();
        let a = SpotId("A-1".to_string());
        let b = SpotId("B-2".to_string());

        r.normalize(&a, Some(&reading(None, Some(1), LedColor::Blue)));
        r.normalize(&b, Some(&reading(None, Some(1), LedColor::Red)));

        let (_, ta) = r.normalize(&a, Some(&reading(None, Some(1), LedColor::Red)));
        let (_, tb) = r.normalize(&b, Some(&reading(None, Some(1), LedColor::Blue)));

        assert_eq!(ta, Some(SpotTransition::JustParked));
        assert_eq!(tb, Some(SpotTransition::JustDeparted));
    }

    #[test]
    fn test_forget_spot() {
        let mut r = SensorReconciler::default();
        r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Red)));
        r.forget_spot(&spot());

        // Memory gone: blue after forget is not a departure
        let (_, t) = r.normalize(&spot(), Some(&reading(None, Some(1), LedColor::Blue)));
        assert!(t.is_none());
    }
}
