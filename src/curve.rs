use serde::{Deserialize, Serialize};

use crate::types::{Profile, ProfileSegment};

/// Target pressure at `t` seconds
///
/// Inside a segment the pressure is interpolated linearly; a zero-length
/// segment yields its end pressure. Between segments the previous segment's
/// end pressure is held, and past the final segment the last end pressure is
/// held. Before the first segment, or for an empty profile, the target is 0.
#[must_use]
pub fn pressure_at_time(segments: &[ProfileSegment], t: f64) -> f64 {
    if let Some(segment) = segments.iter().find(|s| s.contains(t)) {
        return interpolate_segment(segment, t);
    }

    let Some(last) = segments.last() else {
        return 0.0;
    };
    if segments.iter().all(|s| t > s.end_time) {
        return last.end_pressure;
    }

    segments
        .iter()
        .rev()
        .find(|s| s.end_time < t)
        .map_or(0.0, |s| s.end_pressure)
}

/// Index of the first segment containing `t`
#[must_use]
pub fn segment_index_at(segments: &[ProfileSegment], t: f64) -> Option<usize> {
    segments.iter().position(|s| s.contains(t))
}

fn interpolate_segment(segment: &ProfileSegment, t: f64) -> f64 {
    let duration = segment.duration();
    if duration <= 0.0 {
        return segment.end_pressure;
    }
    let progress = (t - segment.start_time) / duration;
    segment.start_pressure + (segment.end_pressure - segment.start_pressure) * progress
}

/// Progress readout computed from the profile alone, without device telemetry
///
/// Never stored as device status; `simulated` is always `true` so serialized
/// readouts cannot be mistaken for measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulatedProgress {
    /// Seconds since the profile started
    pub elapsed_seconds: f64,
    /// Target pressure at `elapsed_seconds`
    pub target_pressure: f64,
    /// Segment containing `elapsed_seconds`, if any
    pub segment_index: Option<usize>,
    /// Number of segments in the profile
    pub total_segments: usize,
    /// Fraction of the total profile duration elapsed, `0.0..=1.0`
    pub fraction_complete: f64,
    /// Whether the profile has run to its end
    pub finished: bool,
    /// Always `true`
    pub simulated: bool,
}

/// Synthesize a progress readout for `profile` after `elapsed_seconds`
#[must_use]
pub fn simulate_progress(profile: &Profile, elapsed_seconds: f64) -> SimulatedProgress {
    let elapsed = elapsed_seconds.max(0.0);
    let total = profile.total_duration();
    let fraction_complete = if total > 0.0 {
        (elapsed / total).clamp(0.0, 1.0)
    } else {
        1.0
    };

    SimulatedProgress {
        elapsed_seconds: elapsed,
        target_pressure: pressure_at_time(&profile.segments, elapsed),
        segment_index: segment_index_at(&profile.segments, elapsed),
        total_segments: profile.segments.len(),
        fraction_complete,
        finished: elapsed >= total,
        simulated: true,
    }
}
