//! Calibration artifacts saved to and loaded from JSON files

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use log::info;
use nalgebra::{Matrix4, Vector3};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use super::CalibError;
use crate::kin::{DhSet, JointLimits, KinParams, KinematicModel};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Session-relative path DH artifacts are saved to.
pub const DH_ARTIFACT_PATH: &str = "calib/robot_dh_parameters.json";

/// Session-relative path hand-eye artifacts are saved to.
pub const HAND_EYE_ARTIFACT_PATH: &str = "calib/hand_eye_calibration.json";

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A calibrated kinematic model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhArtifact {
    pub dh_parameters: DhSet,
    pub tool_offset_mm: [f64; 3],
    pub joint_limits: JointLimits,
    pub calibration_date: DateTime<Utc>,
}

/// A calibrated camera mount, the camera pose in the gripper frame as a
/// row-major homogeneous matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandEyeArtifact {
    pub hand_eye_matrix: [[f64; 4]; 4],
    pub calibration_date: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl DhArtifact {
    /// Snapshot of the model's current geometry.
    pub fn from_model(model: &KinematicModel) -> Self {
        let t: &Vector3<f64> = model.tool_offset();

        Self {
            dh_parameters: *model.dh_parameters(),
            tool_offset_mm: [t.x, t.y, t.z],
            joint_limits: *model.limits(),
            calibration_date: Utc::now(),
        }
    }

    /// Replace the geometry in `kin` with the calibrated one.
    pub fn apply_to(&self, kin: &mut KinParams) {
        kin.dh = self.dh_parameters;
        kin.tool_offset_mm = self.tool_offset_mm;
        kin.min_pos_rad = self.joint_limits.min_rad;
        kin.max_pos_rad = self.joint_limits.max_rad;
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibError> {
        load(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibError> {
        save(self, path)
    }
}

impl HandEyeArtifact {
    pub fn new(gripper_t_camera: &Matrix4<f64>) -> Self {
        let mut hand_eye_matrix = [[0.0; 4]; 4];
        for (r, row) in hand_eye_matrix.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = gripper_t_camera[(r, c)];
            }
        }

        Self {
            hand_eye_matrix,
            calibration_date: Utc::now(),
        }
    }

    pub fn matrix(&self) -> Matrix4<f64> {
        Matrix4::from_fn(|r, c| self.hand_eye_matrix[r][c])
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CalibError> {
        load(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CalibError> {
        save(self, path)
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

fn load<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, CalibError> {
    let file = File::open(path.as_ref())?;
    let artifact = serde_json::from_reader(BufReader::new(file))?;

    info!("Loaded calibration from {:?}", path.as_ref());

    Ok(artifact)
}

fn save<T: Serialize, P: AsRef<Path>>(artifact: &T, path: P) -> Result<(), CalibError> {
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer_pretty(&mut writer, artifact)?;
    writer.flush()?;

    info!("Saved calibration to {:?}", path.as_ref());

    Ok(())
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("arm_exec_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_dh_artifact_file() {
        let mut kin = KinParams::default();
        kin.dh[1].a = 162.5;
        let model = KinematicModel::new(&kin).unwrap();

        let artifact = DhArtifact::from_model(&model);
        let dir = scratch_dir("dh");
        let path = dir.join("calib").join("robot_dh_parameters.json");
        artifact.save(&path).unwrap();

        let loaded = DhArtifact::load(&path).unwrap();
        assert_eq!(loaded, artifact);

        let mut restored = KinParams::default();
        loaded.apply_to(&mut restored);
        assert_eq!(restored, kin);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_hand_eye_artifact_layout() {
        let m = Matrix4::new(
            1.0, 0.0, 0.0, 10.0, //
            0.0, 0.0, -1.0, 20.0, //
            0.0, 1.0, 0.0, 30.0, //
            0.0, 0.0, 0.0, 1.0,
        );
        let artifact = HandEyeArtifact::new(&m);

        // Rows of the file are rows of the matrix
        assert_eq!(artifact.hand_eye_matrix[0], [1.0, 0.0, 0.0, 10.0]);
        assert_eq!(artifact.hand_eye_matrix[1], [0.0, 0.0, -1.0, 20.0]);
        assert_eq!(artifact.matrix(), m);

        let json = serde_json::to_value(&artifact).unwrap();
        assert!(json.get("hand_eye_matrix").is_some());
        assert!(json.get("calibration_date").is_some());
    }

    #[test]
    fn test_load_errors() {
        let dir = scratch_dir("bad");
        assert!(matches!(
            HandEyeArtifact::load(dir.join("missing.json")),
            Err(CalibError::ArtifactIo(_))
        ));

        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.json");
        fs::write(&path, "{\"hand_eye_matrix\": 3}").unwrap();
        assert!(matches!(
            HandEyeArtifact::load(&path),
            Err(CalibError::ArtifactFormat(_))
        ));

        fs::remove_dir_all(dir).ok();
    }
}
