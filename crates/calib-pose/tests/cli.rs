use std::path::Path;

use assert_cmd::Command;
use calib_pose::core::synthetic;
use calib_pose::input::{write_json, FrameFile, ViewsFile};
use calib_pose::marker::MarkerObservation;
use calib_pose::{CalibrationRecord, CameraMatrix, CameraModel, ChessboardSpec, ImageSize};
use nalgebra::Point2;
use predicates::prelude::*;
use tempfile::TempDir;

fn cli() -> Command {
    Command::cargo_bin("calib-pose").expect("binary")
}

fn pinhole() -> CameraModel {
    CameraModel::pinhole(CameraMatrix::new(800.0, 800.0, 400.0, 300.0).expect("matrix"))
}

fn write_camera(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("camera.json");
    CalibrationRecord::from_model(&pinhole())
        .with_image_size(ImageSize::new(800, 600))
        .write_json(&path)
        .expect("write camera");
    path
}

fn square(cx: f64, cy: f64) -> Vec<Point2<f64>> {
    vec![
        Point2::new(cx - 50.0, cy - 50.0),
        Point2::new(cx + 50.0, cy - 50.0),
        Point2::new(cx + 50.0, cy + 50.0),
        Point2::new(cx - 50.0, cy + 50.0),
    ]
}

#[test]
fn calibrate_writes_a_loadable_camera_model() {
    let dir = TempDir::new().expect("tempdir");
    let board = ChessboardSpec::new(9, 6, 0.025).expect("board");
    let poses = synthetic::orbit_poses(10, board.center(), 0.5, 25.0);
    let views = synthetic::project_views(&pinhole(), &board.object_points(), &poses)
        .expect("visible");

    let mut detections: Vec<Option<Vec<Point2<f64>>>> = views
        .iter()
        .map(|v| Some(v.image_points().to_vec()))
        .collect();
    detections.insert(2, None);

    let input = dir.path().join("views.json");
    write_json(
        &input,
        &ViewsFile {
            board,
            image_size: Some(ImageSize::new(800, 600)),
            views: detections,
        },
    )
    .expect("write views");
    let out = dir.path().join("camera.json");
    let report = dir.path().join("report.json");

    cli()
        .arg("calibrate")
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(&out)
        .arg("--report")
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "found chessboards in 10 out of 11 images",
        ))
        .stdout(predicate::str::contains("reprojection: rms"))
        .stdout(predicate::str::contains("average reprojection error: 0.0000"));

    let record = CalibrationRecord::load_json(&out).expect("load");
    let model = record.model().expect("model");
    assert!((model.matrix.fx() - 800.0).abs() < 0.8);
    assert_eq!(record.image_size, Some(ImageSize::new(800, 600)));
    assert_eq!(record.poses().expect("poses").len(), 10);
    assert!(report.exists());
}

#[test]
fn calibrate_without_boards_fails() {
    let dir = TempDir::new().expect("tempdir");
    let input = dir.path().join("views.json");
    write_json(
        &input,
        &ViewsFile {
            board: ChessboardSpec::default(),
            image_size: None,
            views: vec![None, None],
        },
    )
    .expect("write views");

    cli()
        .arg("calibrate")
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(dir.path().join("camera.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("InsufficientData"));
}

#[test]
fn pose_reports_each_marker() {
    let dir = TempDir::new().expect("tempdir");
    let camera = write_camera(dir.path());
    let sq = square(400.0, 300.0);
    let input = dir.path().join("frame.json");
    write_json(
        &input,
        &FrameFile {
            image_size: Some(ImageSize::new(800, 600)),
            markers: vec![
                MarkerObservation {
                    id: 7,
                    corners: sq.clone(),
                },
                MarkerObservation {
                    id: 3,
                    corners: vec![sq[0], sq[3], sq[2], sq[1]],
                },
                MarkerObservation {
                    id: 9,
                    corners: square(120.0, 300.0),
                },
            ],
        },
    )
    .expect("write frame");
    let out = dir.path().join("poses.json");

    cli()
        .arg("pose")
        .arg("--camera")
        .arg(&camera)
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("marker 7: yaw"))
        .stdout(predicate::str::contains("distance 1.600"))
        .stdout(predicate::str::contains("marker 3: rejected"))
        .stdout(predicate::str::contains("(move right)"));

    let raw = std::fs::read_to_string(&out).expect("outcomes");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let outcomes = json.as_array().expect("array");
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[1]["status"], "rejected");
    assert_eq!(outcomes[2]["moves"][0], "right");
}

#[test]
fn undistort_roi_prints_matrix_and_region() {
    let dir = TempDir::new().expect("tempdir");
    let camera = write_camera(dir.path());

    cli()
        .args(["undistort-roi", "--width", "800", "--height", "600", "--camera"])
        .arg(&camera)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"camera_matrix\""))
        .stdout(predicate::str::contains("\"width\": 800"));
}

#[test]
fn missing_camera_file_fails() {
    let dir = TempDir::new().expect("tempdir");
    cli()
        .args(["undistort-roi", "--width", "800", "--height", "600", "--camera"])
        .arg(dir.path().join("nope.json"))
        .assert()
        .failure();
}
