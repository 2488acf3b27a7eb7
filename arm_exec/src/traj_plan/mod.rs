//! # Trajectory planner
//!
//! Linear interpolation in joint space between the current and target joint
//! positions, with joint limit validation of every waypoint.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use crate::kin::{JointLimits, JointVector, KinError, NUM_JOINTS};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Plans and validates joint space trajectories.
#[derive(Debug, Clone)]
pub struct TrajPlanner {
    limits: JointLimits,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors raised while planning.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("A trajectory needs at least one step")]
    NoSteps,

    #[error("Waypoint {index} failed validation: {source}")]
    InvalidWaypoint { index: usize, source: KinError },
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TrajPlanner {
    pub fn new(limits: JointLimits) -> Self {
        Self { limits }
    }

    /// Plan a trajectory of `steps + 1` waypoints from `start` to `end`.
    ///
    /// Waypoint `i` is `start + (end - start) * i / steps`, so the first
    /// waypoint is exactly `start` and the last exactly `end`.
    pub fn plan(
        &self,
        start: &JointVector,
        end: &JointVector,
        steps: usize,
    ) -> Result<Vec<JointVector>, PlanError> {
        if steps == 0 {
            return Err(PlanError::NoSteps);
        }

        let mut path = Vec::with_capacity(steps + 1);

        for i in 0..=steps {
            let t = i as f64 / steps as f64;

            let mut waypoint = [0.0; NUM_JOINTS];
            for j in 0..NUM_JOINTS {
                waypoint[j] = if i == steps {
                    end[j]
                } else {
                    start[j] + (end[j] - start[j]) * t
                };
            }

            path.push(waypoint);
        }

        Ok(path)
    }

    /// Check a waypoint against the joint limits.
    pub fn validate(&self, waypoint: &JointVector) -> Result<(), KinError> {
        self.limits.check(waypoint)
    }

    /// Check every waypoint of a path, reporting the first failure.
    pub fn validate_path(&self, path: &[JointVector]) -> Result<(), PlanError> {
        for (index, waypoint) in path.iter().enumerate() {
            self.validate(waypoint)
                .map_err(|source| PlanError::InvalidWaypoint { index, source })?;
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::kin::KinParams;
    use approx::assert_abs_diff_eq;

    fn planner() -> TrajPlanner {
        TrajPlanner::new(KinParams::default().limits())
    }

    #[test]
    fn test_plan_endpoints() {
        let start = [0.1, -0.2, 0.3, -0.4, 0.5, -0.6];
        let end = [1.0, 0.5, -0.7, 2.0, -1.5, 3.0];

        let path = planner().plan(&start, &end, 20).unwrap();

        assert_eq!(path.len(), 21);
        assert_eq!(path[0], start);
        assert_eq!(path[20], end);

        // Evenly spaced
        for j in 0..NUM_JOINTS {
            assert_abs_diff_eq!(
                path[10][j],
                (start[j] + end[j]) / 2.0,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_plan_single_step() {
        let path = planner()
            .plan(&[0.0; NUM_JOINTS], &[1.0; NUM_JOINTS], 1)
            .unwrap();
        assert_eq!(path, vec![[0.0; NUM_JOINTS], [1.0; NUM_JOINTS]]);

        assert_eq!(
            planner().plan(&[0.0; NUM_JOINTS], &[1.0; NUM_JOINTS], 0),
            Err(PlanError::NoSteps)
        );
    }

    #[test]
    fn test_validate_path() {
        let planner = planner();

        let path = planner
            .plan(&[0.0; NUM_JOINTS], &[0.0, 0.0, 0.0, 0.0, 1.9, 0.0], 10)
            .unwrap();
        assert!(planner.validate_path(&path).is_ok());

        // Goal beyond joint 5's limit fails at the last waypoint only
        let path = planner
            .plan(&[0.0; NUM_JOINTS], &[0.0, 0.0, 0.0, 0.0, 2.2, 0.0], 10)
            .unwrap();
        assert!(matches!(
            planner.validate_path(&path),
            Err(PlanError::InvalidWaypoint { index: 10, .. })
        ));
    }
}
