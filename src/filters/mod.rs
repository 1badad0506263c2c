pub mod innovation_window;
pub mod pose_twist;

pub use innovation_window::InnovationWindow;
pub use pose_twist::{
    weighted_mean_pose, CorrectionStatus, MeasurementNoise, PoseCorrespondence, PoseTwistState,
    ProcessNoise,
};
