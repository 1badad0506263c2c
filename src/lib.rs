//! Online registration of cameras and fixed markers to a robot body frame.
//!
//! Forward kinematics gives the body-frame pose of markers mounted on the
//! robot. Cameras observe those markers and any fixed markers in the scene;
//! every camera extrinsic and fixed-marker pose is tracked by a pose+twist
//! filter and corrected each tick from the implied poses.

pub mod bus;
pub mod capture;
pub mod config;
pub mod correspondence;
pub mod engine;
pub mod error;
pub mod filters;
pub mod fusion;
pub mod health_monitor;
pub mod kinematics;
pub mod live_status;
pub mod replay;
pub mod sim;
pub mod types;

pub use config::RegistrationConfig;
pub use error::{RegResult, RegistrationError};
pub use fusion::{FusionContext, FusionCycle, FusionEvent, TickReport};
pub use types::{ConfigSample, MarkerBatch, MarkerDetection, PoseEstimateSet};
