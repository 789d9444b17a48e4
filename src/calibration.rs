use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ModspressoError, Result};

/// Highest control level the dimmer accepts
pub const MAX_CONTROL_LEVEL: u8 = 100;

/// Highest pressure the firmware accepts in a calibration sample, in bar
pub const MAX_CALIBRATION_PRESSURE: f64 = 12.0;

/// Granularity of control levels produced by [`level_for_pressure`]
pub const LEVEL_STEP: u8 = 5;

/// Sampled level-to-pressure mapping
///
/// Levels are unique and kept in ascending order. Serializes as a JSON object
/// keyed by level, which is also the wire shape of `set_calibration_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<u8, f64>", try_from = "BTreeMap<u8, f64>")]
pub struct CalibrationCurve {
    samples: BTreeMap<u8, f64>,
}

impl TryFrom<BTreeMap<u8, f64>> for CalibrationCurve {
    type Error = ModspressoError;

    fn try_from(samples: BTreeMap<u8, f64>) -> Result<Self> {
        Self::from_samples(samples)
    }
}

impl From<CalibrationCurve> for BTreeMap<u8, f64> {
    fn from(curve: CalibrationCurve) -> Self {
        curve.samples
    }
}

impl CalibrationCurve {
    /// Create an empty curve
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a curve from `(level, pressure)` pairs
    ///
    /// A repeated level keeps the last pressure given for it.
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::InvalidParameters`] if any sample is out of range.
    pub fn from_samples<I>(samples: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u8, f64)>,
    {
        let mut curve = Self::new();
        for (level, pressure) in samples {
            curve.insert(level, pressure)?;
        }
        Ok(curve)
    }

    /// Insert or replace a sample, returning the pressure it replaced
    ///
    /// # Errors
    ///
    /// Returns [`ModspressoError::InvalidParameters`] if the level exceeds 100 or the
    /// pressure is not within `0..=12` bar.
    pub fn insert(&mut self, level: u8, pressure: f64) -> Result<Option<f64>> {
        if level > MAX_CONTROL_LEVEL {
            return Err(ModspressoError::InvalidParameters(format!(
                "calibration level {level} is out of range (0 - {MAX_CONTROL_LEVEL})"
            )));
        }
        if !pressure.is_finite() || !(0.0..=MAX_CALIBRATION_PRESSURE).contains(&pressure) {
            return Err(ModspressoError::InvalidParameters(format!(
                "calibration pressure {pressure} bar is out of range (0 - {MAX_CALIBRATION_PRESSURE})"
            )));
        }
        Ok(self.samples.insert(level, pressure))
    }

    /// Remove the sample at `level`
    pub fn remove(&mut self, level: u8) -> Option<f64> {
        self.samples.remove(&level)
    }

    /// Number of explicit samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the curve has no explicit samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Explicit samples in ascending level order
    pub fn samples(&self) -> impl Iterator<Item = (u8, f64)> + '_ {
        self.samples.iter().map(|(level, pressure)| (*level, *pressure))
    }

    /// Copy of the curve with the `(0, 0)` anchor added when no level-0 sample exists
    #[must_use]
    pub fn anchored(&self) -> Self {
        let mut samples = self.samples.clone();
        samples.entry(0).or_insert(0.0);
        Self { samples }
    }

    /// Pressure at every level `0..=100` on the anchored curve, rounded to 0.1 bar
    #[must_use]
    pub fn sampled(&self) -> Vec<(u8, f64)> {
        let anchored = self.anchored();
        (0..=MAX_CONTROL_LEVEL)
            .map(|level| {
                let pressure = pressure_for_level(&anchored, level);
                (level, (pressure * 10.0).round() / 10.0)
            })
            .collect()
    }
}

/// Pressure produced at a control level
///
/// Returns 0 for an empty curve and the only sample's pressure for a
/// single-sample curve. Levels outside the sampled range clamp to the nearest
/// extreme sample.
#[must_use]
pub fn pressure_for_level(curve: &CalibrationCurve, level: u8) -> f64 {
    let points: Vec<(f64, f64)> = curve
        .samples()
        .map(|(l, p)| (f64::from(l), p))
        .collect();

    match points.as_slice() {
        [] => 0.0,
        [(_, pressure)] => *pressure,
        _ => interpolate(&points, f64::from(level)),
    }
}

/// Control level needed to reach a pressure, quantized to steps of 5
///
/// Pressures beyond the sampled range clamp to the level of the extreme sample;
/// the clamped level is returned as sampled, without quantization. Returns 0
/// for an empty curve and the only sample's level for a single-sample curve.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn level_for_pressure(curve: &CalibrationCurve, pressure: f64) -> u8 {
    let samples: Vec<(u8, f64)> = curve.samples().collect();

    match samples.as_slice() {
        [] => return 0,
        [(level, _)] => return *level,
        _ => {}
    }

    let (low_level, low_pressure) = boundary_sample(&samples, |a, b| a < b);
    let (high_level, high_pressure) = boundary_sample(&samples, |a, b| a > b);

    if pressure <= low_pressure {
        return low_level;
    }
    if pressure >= high_pressure {
        return high_level;
    }

    let level = samples
        .windows(2)
        .find_map(|pair| {
            let (l0, p0) = (f64::from(pair[0].0), pair[0].1);
            let (l1, p1) = (f64::from(pair[1].0), pair[1].1);
            if !(p0.min(p1) <= pressure && pressure <= p0.max(p1)) {
                return None;
            }
            if (p1 - p0).abs() < f64::EPSILON {
                return Some(l0);
            }
            Some(l0 + (pressure - p0) / (p1 - p0) * (l1 - l0))
        })
        .unwrap_or_else(|| f64::from(low_level));

    let step = f64::from(LEVEL_STEP);
    let quantized = (level / step).round() * step;
    quantized.clamp(0.0, f64::from(MAX_CONTROL_LEVEL)) as u8
}

/// First sample (in level order) whose pressure is extreme under `better`
fn boundary_sample(samples: &[(u8, f64)], better: impl Fn(f64, f64) -> bool) -> (u8, f64) {
    let mut best = samples[0];
    for &sample in &samples[1..] {
        if better(sample.1, best.1) {
            best = sample;
        }
    }
    best
}

/// Piecewise-linear interpolation over points sorted by their first coordinate
///
/// `points` must hold at least two entries.
pub(crate) fn interpolate(points: &[(f64, f64)], x: f64) -> f64 {
    let (first, last) = (points[0], points[points.len() - 1]);
    if x <= first.0 {
        return first.1;
    }
    if x >= last.0 {
        return last.1;
    }

    points
        .windows(2)
        .find(|pair| pair[0].0 <= x && x <= pair[1].0)
        .map_or(last.1, |pair| {
            let (k0, v0) = pair[0];
            let (k1, v1) = pair[1];
            if (k1 - k0).abs() < f64::EPSILON {
                v1
            } else {
                v0 + (x - k0) / (k1 - k0) * (v1 - v0)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_curve() -> CalibrationCurve {
        CalibrationCurve::from_samples([(10, 1.0), (50, 6.5), (100, 9.0)]).unwrap()
    }

    fn default_machine_curve() -> CalibrationCurve {
        CalibrationCurve::from_samples([
            (10, 1.0),
            (20, 2.0),
            (30, 3.0),
            (40, 5.0),
            (50, 6.5),
            (60, 7.5),
            (70, 9.0),
            (80, 9.0),
            (90, 9.0),
            (100, 9.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_pressure_interpolates_between_samples() {
        let curve = reference_curve();
        assert!((pressure_for_level(&curve, 30) - 3.75).abs() < 1e-9);
        assert!((pressure_for_level(&curve, 50) - 6.5).abs() < 1e-9);
        assert!((pressure_for_level(&curve, 75) - 7.75).abs() < 1e-9);
    }

    #[test]
    fn test_pressure_clamps_outside_range() {
        let curve = reference_curve();
        assert!((pressure_for_level(&curve, 0) - 1.0).abs() < 1e-9);
        assert!((pressure_for_level(&curve, 5) - 1.0).abs() < 1e-9);

        let short = CalibrationCurve::from_samples([(20, 2.0), (60, 7.0)]).unwrap();
        assert!((pressure_for_level(&short, 90) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_curves() {
        let empty = CalibrationCurve::new();
        assert!(pressure_for_level(&empty, 40).abs() < f64::EPSILON);
        assert_eq!(level_for_pressure(&empty, 4.0), 0);

        let single = CalibrationCurve::from_samples([(40, 5.0)]).unwrap();
        assert!((pressure_for_level(&single, 90) - 5.0).abs() < f64::EPSILON);
        assert_eq!(level_for_pressure(&single, 1.0), 40);
    }

    #[test]
    fn test_level_quantized_to_five() {
        let curve = reference_curve();
        assert_eq!(level_for_pressure(&curve, 3.75), 30);
        // 39.09 rounds to 40
        assert_eq!(level_for_pressure(&curve, 5.0), 40);
        assert_eq!(level_for_pressure(&curve, 1.2), 10);
    }

    #[test]
    fn test_level_clamp_takes_precedence_over_rounding() {
        let curve = CalibrationCurve::from_samples([(12, 1.0), (98, 9.0)]).unwrap();
        assert_eq!(level_for_pressure(&curve, 0.2), 12);
        assert_eq!(level_for_pressure(&curve, 11.0), 98);
    }

    #[test]
    fn test_level_on_plateau_picks_lowest_level() {
        let curve = default_machine_curve();
        assert_eq!(level_for_pressure(&curve, 9.0), 70);
        assert_eq!(level_for_pressure(&curve, 12.0), 70);
        assert_eq!(level_for_pressure(&curve, 0.0), 10);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        for curve in [reference_curve(), default_machine_curve()] {
            let levels: Vec<u8> = curve.samples().map(|(l, _)| l).collect();
            let (min, max) = (levels[0], levels[levels.len() - 1]);
            for level in (min..=max).step_by(5) {
                let pressure = pressure_for_level(&curve, level);
                let back = level_for_pressure(&curve, pressure);
                // Plateau samples map back to the first level reaching the pressure
                if pressure < 9.0 {
                    assert!(
                        back.abs_diff(level) <= LEVEL_STEP,
                        "level {level} -> {pressure} bar -> {back}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_monotonic_curves_stay_monotonic() {
        let curve = reference_curve();
        let mut previous_pressure = f64::NEG_INFINITY;
        for level in 0..=100 {
            let pressure = pressure_for_level(&curve, level);
            assert!(pressure >= previous_pressure);
            previous_pressure = pressure;
        }

        let mut previous_level = 0;
        for tenth_bar in 0..=100 {
            let level = level_for_pressure(&curve, f64::from(tenth_bar) / 10.0);
            assert!(level >= previous_level);
            previous_level = level;
        }
    }

    #[test]
    fn test_insert_validation() {
        let mut curve = CalibrationCurve::new();
        assert!(curve.insert(101, 5.0).is_err());
        assert!(curve.insert(50, -1.0).is_err());
        assert!(curve.insert(50, 12.5).is_err());
        assert!(curve.insert(50, f64::NAN).is_err());
        assert_eq!(curve.insert(50, 6.0).unwrap(), None);
        assert_eq!(curve.insert(50, 6.5).unwrap(), Some(6.0));
        assert_eq!(curve.len(), 1);
    }

    #[test]
    fn test_anchored_and_sampled_curve() {
        let curve = reference_curve();
        let anchored = curve.anchored();
        assert_eq!(anchored.len(), 4);
        assert!((pressure_for_level(&anchored, 5) - 0.5).abs() < 1e-9);

        let sampled = curve.sampled();
        assert_eq!(sampled.len(), 101);
        assert_eq!(sampled[0], (0, 0.0));
        assert_eq!(sampled[30], (30, 3.8));
        assert_eq!(sampled[100], (100, 9.0));
    }

    #[test]
    fn test_serializes_as_level_keyed_object() {
        let curve = reference_curve();
        let json = serde_json::to_string(&curve).unwrap();
        assert_eq!(json, r#"{"10":1.0,"50":6.5,"100":9.0}"#);

        let parsed: CalibrationCurve = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, curve);
    }

    #[test]
    fn test_deserialize_checks_ranges() {
        assert!(serde_json::from_str::<CalibrationCurve>(r#"{"10":1.0,"150":9.0}"#).is_err());
        assert!(serde_json::from_str::<CalibrationCurve>(r#"{"10":13.5}"#).is_err());
        assert!(serde_json::from_str::<CalibrationCurve>(r#"{"10":-0.5}"#).is_err());

        let empty: CalibrationCurve = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }
}
