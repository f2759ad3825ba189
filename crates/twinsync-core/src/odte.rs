//! ODTE (Observed Degree of Twinning Effectiveness) estimation.
//!
//! Combines three sub-scores computed over a sliding window of delay samples:
//!
//! - **timeliness**: share of samples that arrived faster than the desired
//!   delay, computed on the sorted window as `i / n` where `i` is the first
//!   index whose delay reaches the target (1.0 when none does)
//! - **reliability**: received samples relative to the expected count for the
//!   window. Not capped, a burst above the nominal rate scores above 1.0
//! - **availability**: supplied by an [`AvailabilitySource`]
//!
//! `odte = timeliness * reliability * availability`.
//!
//! The functions here are pure. Sample order never affects the result.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinError};

/// Estimator parameters for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdteParams {
    pub desired_timeliness_sec: f64,
    pub expected_msg_per_sec: f64,
    pub window_sec: f64,
}

impl OdteParams {
    /// Expected number of samples in one window.
    pub fn expected_samples(&self) -> f64 {
        self.expected_msg_per_sec * self.window_sec
    }

    pub fn validate(&self) -> Result<()> {
        let expected = self.expected_samples();
        if !expected.is_finite() || expected <= 0.0 {
            return Err(TwinError::InvalidParameters(format!(
                "expected samples per window must be positive, got {} msg/s * {} s",
                self.expected_msg_per_sec, self.window_sec
            )));
        }
        if !self.desired_timeliness_sec.is_finite() {
            return Err(TwinError::InvalidParameters(
                "desired timeliness must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// One ODTE evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdteResult {
    pub timeliness: f64,
    pub reliability: f64,
    pub availability: f64,
    pub odte: f64,
    pub samples: usize,
}

/// Supplies the availability sub-score.
pub trait AvailabilitySource: Send + Sync {
    /// Availability in `[0, 1]`. Out-of-range values are clamped by the caller.
    fn availability(&self) -> f64;
}

/// Availability fixed at a constant value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantAvailability(pub f64);

impl Default for ConstantAvailability {
    fn default() -> Self {
        Self(1.0)
    }
}

impl AvailabilitySource for ConstantAvailability {
    fn availability(&self) -> f64 {
        self.0
    }
}

/// Share of samples strictly below `desired_sec`.
///
/// The sorted window is cut at the first sample that reaches `desired_sec`,
/// so a delay equal to the target lands on the late side. Returns
/// `InsufficientData` for an empty set.
pub fn timeliness(samples: &[f64], desired_sec: f64) -> Result<f64> {
    if samples.is_empty() {
        return Err(TwinError::InsufficientData(
            "no delay samples in window".into(),
        ));
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let first_late = sorted.partition_point(|&d| d < desired_sec);
    if first_late == sorted.len() {
        Ok(1.0)
    } else {
        Ok(first_late as f64 / sorted.len() as f64)
    }
}

/// Received-to-expected ratio. Empty set yields 0.0.
pub fn reliability(sample_count: usize, expected_msg_per_sec: f64, window_sec: f64) -> Result<f64> {
    let expected = expected_msg_per_sec * window_sec;
    if !expected.is_finite() || expected <= 0.0 {
        return Err(TwinError::InvalidParameters(format!(
            "expected samples per window must be positive, got {expected}"
        )));
    }
    Ok(sample_count as f64 / expected)
}

/// Stateless estimator holding the availability provider.
pub struct OdteEstimator {
    availability: Box<dyn AvailabilitySource>,
}

impl OdteEstimator {
    pub fn new(availability: Box<dyn AvailabilitySource>) -> Self {
        Self { availability }
    }

    /// Current availability, clamped to `[0, 1]`.
    pub fn availability(&self) -> f64 {
        self.availability.availability().clamp(0.0, 1.0)
    }

    /// Compute all sub-scores for one window.
    ///
    /// Parameters are checked before data, so a misconfigured twin reports
    /// `InvalidParameters` even while its window is still empty.
    pub fn estimate(&self, samples: &[f64], params: &OdteParams) -> Result<OdteResult> {
        params.validate()?;
        let timeliness = timeliness(samples, params.desired_timeliness_sec)?;
        let reliability = reliability(
            samples.len(),
            params.expected_msg_per_sec,
            params.window_sec,
        )?;
        let availability = self.availability();
        Ok(OdteResult {
            timeliness,
            reliability,
            availability,
            odte: timeliness * reliability * availability,
            samples: samples.len(),
        })
    }
}

impl Default for OdteEstimator {
    fn default() -> Self {
        Self::new(Box::new(ConstantAvailability::default()))
    }
}
