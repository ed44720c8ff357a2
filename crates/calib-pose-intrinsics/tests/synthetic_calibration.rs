use std::sync::atomic::AtomicBool;

use calib_pose_core::optim::Termination;
use calib_pose_core::{
    synthetic, CalibrationRecord, CameraMatrix, CameraModel, ChessboardSpec, CorrespondenceSet,
    DistortionCoeffs, ExtrinsicPose, ImageSize,
};
use calib_pose_intrinsics::{
    CalibrationDataset, CalibrationError, CalibrationParams, CalibrationSolver,
    ReprojectionEvaluator, ViewRejection,
};
use nalgebra::{Point2, Point3};

fn rel(a: f64, b: f64) -> f64 {
    (a - b).abs() / b.abs()
}

fn scene(
    model: &CameraModel,
    count: usize,
    tilt_deg: f64,
) -> (Vec<ExtrinsicPose>, Vec<CorrespondenceSet>) {
    let board = ChessboardSpec::new(9, 6, 0.025).expect("board");
    let poses = synthetic::orbit_poses(count, board.center(), 0.5, tilt_deg);
    let views =
        synthetic::project_views(model, &board.object_points(), &poses).expect("board visible");
    (poses, views)
}

fn pinhole_800() -> CameraModel {
    CameraModel::pinhole(CameraMatrix::new(800.0, 800.0, 400.0, 300.0).expect("matrix"))
}

#[test]
fn ten_view_chessboard_scenario() {
    let truth = pinhole_800();
    let (_, views) = scene(&truth, 10, 25.0);

    let calib = CalibrationSolver::default().solve(&views).expect("calibration");
    assert!(calib.converged);
    assert!(rel(calib.model.matrix.fx(), 800.0) < 0.01);
    assert!(rel(calib.model.matrix.fy(), 800.0) < 0.01);

    let report = calib.reprojection_report(&views).expect("report");
    assert_eq!(report.views.len(), 10);
    assert!(report.mean < 0.1, "mean {}", report.mean);
}

#[test]
fn zero_noise_recovers_intrinsics_and_extrinsics() {
    let truth = pinhole_800();
    let (poses, views) = scene(&truth, 10, 25.0);
    let calib = CalibrationSolver::default().solve(&views).expect("calibration");

    let k = calib.model.matrix;
    assert!(rel(k.fx(), 800.0) < 1e-3, "fx {}", k.fx());
    assert!(rel(k.fy(), 800.0) < 1e-3, "fy {}", k.fy());
    assert!(rel(k.cx(), 400.0) < 1e-3, "cx {}", k.cx());
    assert!(rel(k.cy(), 300.0) < 1e-3, "cy {}", k.cy());

    for (i, gt) in poses.iter().enumerate() {
        let est = calib.pose_of(i).expect("view used");
        assert!(est.rotation_angle_to(gt) < 1e-3);
        assert!((est.translation - gt.translation).norm() / gt.translation.norm() < 1e-3);
    }

    let report = ReprojectionEvaluator::evaluate(&calib.model, &calib.poses, &views).expect("eval");
    assert!(report.mean < 1e-6, "mean {}", report.mean);
}

#[test]
fn recovers_lens_distortion() {
    let truth = CameraModel::new(
        CameraMatrix::new(805.0, 795.0, 404.0, 296.0).expect("matrix"),
        DistortionCoeffs::from_array([-0.2, 0.05, 0.001, -0.0005, 0.0]).expect("coeffs"),
    );
    let (_, views) = scene(&truth, 12, 30.0);
    let solver = CalibrationSolver::new(CalibrationParams {
        fix_k3: true,
        ..CalibrationParams::default()
    });
    let calib = solver.solve(&views).expect("calibration");

    let k = calib.model.matrix;
    assert!(rel(k.fx(), 805.0) < 1e-3, "fx {}", k.fx());
    assert!(rel(k.fy(), 795.0) < 1e-3, "fy {}", k.fy());
    assert!(rel(k.cx(), 404.0) < 1e-3, "cx {}", k.cx());
    assert!(rel(k.cy(), 296.0) < 1e-3, "cy {}", k.cy());

    let d = calib.model.distortion;
    assert!((d.k1 + 0.2).abs() < 1e-3, "k1 {}", d.k1);
    assert!((d.k2 - 0.05).abs() < 5e-3, "k2 {}", d.k2);
    assert_eq!(d.k3, 0.0);
    assert!(calib.rms < 1e-3, "rms {}", calib.rms);
}

#[test]
fn noisy_detections_still_calibrate() {
    let truth = pinhole_800();
    let (_, views) = scene(&truth, 10, 25.0);
    let noisy: Vec<_> = views
        .iter()
        .enumerate()
        .map(|(i, v)| synthetic::perturb(v, 1000 + i as u64, 0.05))
        .collect();

    let calib = CalibrationSolver::default().solve(&noisy).expect("calibration");
    assert!(rel(calib.model.matrix.fx(), 800.0) < 0.01);
    assert!(calib.rms < 0.1, "rms {}", calib.rms);
}

#[test]
fn degenerate_views_are_excluded_not_fatal() {
    let truth = pinhole_800();
    let (_, mut views) = scene(&truth, 8, 25.0);
    let line = CorrespondenceSet::new(
        (0..6).map(|i| Point3::new(i as f64 * 0.025, 0.0, 0.0)).collect(),
        (0..6).map(|i| Point2::new(100.0 + 20.0 * i as f64, 50.0)).collect(),
    )
    .expect("set");
    views.insert(3, line);

    let calib = CalibrationSolver::default().solve(&views).expect("calibration");
    assert_eq!(calib.view_indices.len(), 8);
    assert!(!calib.view_indices.contains(&3));
    assert_eq!(calib.rejected.len(), 1);
    assert_eq!(calib.rejected[0].index, 3);
    assert_eq!(calib.rejected[0].reason, ViewRejection::Collinear);
    assert!(calib.pose_of(3).is_none());
}

#[test]
fn single_view_uses_centered_principal_point_when_size_known() {
    let truth = CameraModel::pinhole(CameraMatrix::new(800.0, 800.0, 399.5, 299.5).expect("k"));
    let (_, views) = scene(&truth, 1, 30.0);

    let without = CalibrationSolver::default().solve(&views);
    assert!(matches!(without, Err(CalibrationError::InsufficientData { .. })));

    let solver = CalibrationSolver::new(CalibrationParams {
        image_size: Some(ImageSize::new(800, 600)),
        zero_distortion: true,
        ..CalibrationParams::default()
    });
    let calib = solver.solve(&views).expect("single-view calibration");
    assert!(calib.rms < 1e-3);
    assert!(calib.model.distortion.is_zero());
}

#[test]
fn iteration_budget_exhaustion_reports_best_effort() {
    let truth = CameraModel::new(
        CameraMatrix::new(800.0, 800.0, 400.0, 300.0).expect("matrix"),
        DistortionCoeffs::from_array([-0.25, 0.08, 0.0, 0.0, 0.0]).expect("coeffs"),
    );
    let (_, views) = scene(&truth, 10, 30.0);
    let solver = CalibrationSolver::new(CalibrationParams {
        max_iterations: 1,
        ..CalibrationParams::default()
    });

    match solver.solve(&views) {
        Err(CalibrationError::ConvergenceFailure { best }) => {
            assert!(!best.converged);
            assert_eq!(best.poses.len(), 10);
            assert!(best.final_cost <= best.initial_cost);
        }
        other => panic!("expected ConvergenceFailure, got {other:?}"),
    }
}

#[test]
fn stalled_refinement_is_a_convergence_failure() {
    let truth = CameraModel::new(
        CameraMatrix::new(800.0, 800.0, 400.0, 300.0).expect("matrix"),
        DistortionCoeffs::from_array([-0.25, 0.08, 0.0, 0.0, 0.0]).expect("coeffs"),
    );
    let (_, views) = scene(&truth, 10, 30.0);
    // a trust region this small cannot move the distortion-free start
    let solver = CalibrationSolver::new(CalibrationParams {
        step_bound: 1e-12,
        ..CalibrationParams::default()
    });

    match solver.solve(&views) {
        Err(CalibrationError::ConvergenceFailure { best }) => {
            assert!(!best.converged);
            assert_eq!(best.termination, Termination::DampingExhausted);
            assert!(best.rms > 1e-3, "rms {}", best.rms);
        }
        other => panic!("expected ConvergenceFailure, got {other:?}"),
    }
}

#[test]
fn cancellation_flag_stops_the_solve() {
    let (_, views) = scene(&pinhole_800(), 10, 25.0);
    let cancel = AtomicBool::new(true);
    let result = CalibrationSolver::default().solve_with_cancel(&views, &cancel);
    assert!(matches!(result, Err(CalibrationError::Cancelled)));
}

#[test]
fn dataset_to_persisted_record() {
    let truth = pinhole_800();
    let board = ChessboardSpec::new(9, 6, 0.025).expect("board");
    let poses = synthetic::orbit_poses(9, board.center(), 0.5, 25.0);

    let mut dataset = CalibrationDataset::new(board)
        .expect("dataset")
        .with_image_size(ImageSize::new(800, 600));
    for (i, pose) in poses.iter().enumerate() {
        if i == 4 {
            dataset.add_detection(None).expect("miss");
        }
        let corners: Vec<Point2<f64>> = board
            .object_points()
            .iter()
            .map(|p| truth.project(p, pose).expect("visible"))
            .collect();
        dataset.add_detection(Some(corners)).expect("detection");
    }
    assert_eq!(dataset.summary(), "found chessboards in 9 out of 10 images");

    let calib = dataset.calibrate(&CalibrationSolver::default()).expect("calibration");
    let record = calib.to_record(dataset.image_size());
    let json = serde_json::to_string(&record).expect("json");
    let back = CalibrationRecord::from_json_str(&json).expect("load");
    assert_eq!(back, record);
    assert_eq!(back.poses().expect("poses").len(), 9);
    assert!(rel(back.model().expect("model").matrix.fx(), 800.0) < 1e-3);
}
