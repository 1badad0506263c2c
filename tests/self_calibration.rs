use pose_registration_rs::fusion::{EntityId, FusionContext, FusionCycle, FusionEvent};
use pose_registration_rs::kinematics::{ForwardKinematics, SerialChain};
use pose_registration_rs::replay::PoseError;
use pose_registration_rs::sim::{SimConfig, SimulatedRig};
use pose_registration_rs::types::linalg::pose_from_qutr;
use pose_registration_rs::types::MarkerDetection;
use pose_registration_rs::{MarkerBatch, RegistrationConfig, RegistrationError};

struct Harness {
    cycle: FusionCycle,
    ctx: FusionContext,
    rig: SimulatedRig,
    dt: f64,
}

impl Harness {
    fn new(config: &RegistrationConfig, sim: &SimConfig) -> Self {
        let chain = SerialChain::from_config(&config.kinematics).unwrap();
        let rig = SimulatedRig::new(config, sim).unwrap();
        Harness {
            cycle: FusionCycle::new(config, Box::new(chain)).unwrap(),
            ctx: FusionContext::from_config(config),
            dt: rig.period().as_secs_f64(),
            rig,
        }
    }

    /// One simulated tick, with a hook to edit the batches before fusion.
    fn step_with(&mut self, edit: impl FnOnce(&mut Vec<MarkerBatch>)) -> Vec<FusionEvent> {
        let mut frame = self.rig.step();
        edit(&mut frame.batches);
        let batches: Vec<Option<MarkerBatch>> = frame.batches.into_iter().map(Some).collect();
        self.cycle
            .tick(&mut self.ctx, self.dt, Some(&frame.config), &batches)
            .unwrap()
            .events
    }

    fn step(&mut self) -> Vec<FusionEvent> {
        self.step_with(|_| {})
    }

    fn camera_error(&self, i: usize) -> PoseError {
        PoseError::between(self.ctx.cameras()[i].pose(), self.rig.truth_camera(i).unwrap())
    }

    fn fixed_marker_error(&self, k: usize) -> PoseError {
        PoseError::between(self.ctx.fixed_markers()[k].pose(), self.rig.truth_fixed_marker(k).unwrap())
    }
}

fn kinematic_only() -> RegistrationConfig {
    RegistrationConfig { fixed_markers: Vec::new(), ..Default::default() }
}

#[test]
fn test_camera_converges_from_kinematic_markers() {
    let mut h = Harness::new(&kinematic_only(), &SimConfig::default());

    let mut errors = Vec::new();
    for _ in 0..60 {
        h.step();
        errors.push(h.camera_error(0).translation_m);
    }

    let at_50 = h.camera_error(0);
    assert!(errors[49] < 0.01, "translation error at tick 50: {}", errors[49]);
    assert!(at_50.rotation_rad < 0.01, "rotation error {}", at_50.rotation_rad);

    let first: f64 = errors[..10].iter().sum::<f64>() / 10.0;
    let last: f64 = errors[50..].iter().sum::<f64>() / 10.0;
    assert!(last < first);
}

#[test]
fn test_static_arm_single_marker_converges() {
    let mut config = kinematic_only();
    config.correspondences.truncate(1);
    config.refine_hands = false;
    let sim = SimConfig { joint_amplitude: 0.0, ..Default::default() };
    let mut h = Harness::new(&config, &sim);

    let mut errors = Vec::new();
    for _ in 0..50 {
        h.step();
        errors.push(h.camera_error(0).translation_m);
    }

    assert!(errors[49] < 0.01, "translation error at tick 50: {}", errors[49]);
    assert!(errors[49] < errors[0]);

    // Error trend over consecutive 10-tick windows never climbs past the noise floor
    let means: Vec<f64> = errors.chunks(10).map(|w| w.iter().sum::<f64>() / w.len() as f64).collect();
    for pair in means.windows(2) {
        assert!(pair[1] <= pair[0] + 0.002, "window means {:?}", means);
    }
    assert!(means[4] < means[0], "window means {:?}", means);
}

#[test]
fn test_camera_and_fixed_marker_bootstrap() {
    let config = RegistrationConfig { kinematic_weight: 10.0, fixed_marker_weight: 1.0, ..Default::default() };
    let mut h = Harness::new(&config, &SimConfig::default());

    for _ in 0..20 {
        h.step();
    }
    let early = h.fixed_marker_error(0);
    for _ in 0..280 {
        h.step();
    }

    let camera = h.camera_error(0);
    let marker = h.fixed_marker_error(0);
    assert!(camera.translation_m < 0.02, "camera {:?}", camera);
    assert!(camera.rotation_rad < 0.02, "camera {:?}", camera);
    assert!(marker.translation_m < 0.05, "marker {:?}", marker);
    assert!(marker.rotation_rad < 0.05, "marker {:?}", marker);
    assert!(marker.translation_m < early.translation_m);
}

#[test]
fn test_two_cameras_share_fixed_marker() {
    let mut config = RegistrationConfig { kinematic_weight: 10.0, ..Default::default() };
    config.cameras.push(pose_registration_rs::config::CameraConfig {
        name: "cam1".into(),
        channel: "pir-marker-1".into(),
    });
    let mut h = Harness::new(&config, &SimConfig::default());
    for _ in 0..200 {
        h.step();
    }
    for i in 0..2 {
        let err = h.camera_error(i);
        assert!(err.translation_m < 0.02, "camera {} {:?}", i, err);
    }
    let out = h.ctx.publish(0, 0);
    assert_eq!(out.poses.len(), 2 + 2 + 1);
    assert!(out.fixed_marker(2, 0).is_some());
}

#[test]
fn test_unresolved_marker_leaves_estimates_identical() {
    let sim = SimConfig::default();
    let mut baseline = Harness::new(&RegistrationConfig::default(), &sim);
    let mut polluted = Harness::new(&RegistrationConfig::default(), &sim);

    for _ in 0..30 {
        baseline.step();
        let events = polluted.step_with(|batches| {
            let stray = MarkerDetection { id: 99, weight: 1.0, pose: [0.0, 0.0, 0.0, 1.0, 0.3, 0.3, 0.3] };
            batches[0].detections.push(stray);
            batches[0].count += 1;
        });
        assert!(events.contains(&FusionEvent::DetectionUnresolved { camera: 0, marker: 99 }));
    }

    assert_eq!(baseline.ctx.cameras(), polluted.ctx.cameras());
    assert_eq!(baseline.ctx.fixed_markers(), polluted.ctx.fixed_markers());
}

#[test]
fn test_low_confidence_detections_are_ignored() {
    let config = kinematic_only();
    let mut h = Harness::new(&config, &SimConfig { detection_weight: 0.2, ..Default::default() });

    let initial_trace = h.ctx.cameras()[0].covariance_trace();
    for _ in 0..10 {
        let events = h.step();
        assert!(events.iter().any(|e| matches!(e, FusionEvent::DetectionGated { .. })));
        assert!(!events.iter().any(|e| matches!(e, FusionEvent::Corrected { entity: EntityId::Camera(_), .. })));
    }
    assert!(h.ctx.cameras()[0].window().is_empty());
    assert!(h.ctx.cameras()[0].covariance_trace() > initial_trace);
    assert_eq!(h.ctx.cameras()[0].pose().translation.vector.norm(), 0.0);
}

#[test]
fn test_intermittent_detections_still_converge() {
    let mut h = Harness::new(&kinematic_only(), &SimConfig { dropout: 0.5, seed: 11, ..Default::default() });
    for _ in 0..150 {
        h.step();
    }
    let err = h.camera_error(0);
    assert!(err.translation_m < 0.02, "{:?}", err);
}

#[test]
fn test_single_sample_window_converges() {
    let config = RegistrationConfig { window: 1, ..kinematic_only() };
    let mut h = Harness::new(&config, &SimConfig::default());
    for _ in 0..100 {
        h.step();
    }
    assert_eq!(h.ctx.cameras()[0].window().len(), 1);
    assert!(h.camera_error(0).translation_m < 0.02);
}

#[test]
fn test_hands_follow_kinematics_exactly() {
    let mut h = Harness::new(&RegistrationConfig::default(), &SimConfig::default());
    h.step();
    let out = h.ctx.publish(1, 1);
    let left = pose_from_qutr(out.left_hand().unwrap()).unwrap();
    let chain = h.cycle.kinematics();
    let frame = chain.frame_index("left_wrist").unwrap();
    let expected = h.ctx.frame_poses().unwrap()[frame];
    assert!((left.translation.vector - expected.translation.vector).norm() < 1e-12);
}

#[test]
fn test_truncated_config_sample_is_fatal() {
    let mut h = Harness::new(&RegistrationConfig::default(), &SimConfig::default());
    let mut frame = h.rig.step();
    frame.config.values.truncate(8);
    let batches: Vec<Option<MarkerBatch>> = frame.batches.into_iter().map(Some).collect();
    let before = h.ctx.cameras().to_vec();

    let err = h.cycle.tick(&mut h.ctx, h.dt, Some(&frame.config), &batches).unwrap_err();
    assert!(matches!(err, RegistrationError::FrameSize { expected: 16, actual: 8, .. }));
    assert_eq!(h.ctx.cameras(), &before[..]);
}
