//! End-to-end engine tests over synthetic plates.
//!
//! Frames are rendered at 0.5 mm/px on a 500×600 mm plate; templates are
//! feature-rich synthetic logos pasted at known poses. These pin down the
//! full measurement contract: pose recovery, tolerance flags, ordering,
//! fallback behaviour, and determinism.

use image::GrayImage;

use crate::config::{
    DetectorConfig, FallbackParams, FeatureParams, LogoSpec, MatchingParams, PlaneConfig, RoiSpec,
    Thresholds,
};
use crate::homography::RansacParams;
use crate::test_utils::{gray_to_bgr, paste_transformed, synthetic_logo, write_temp_png};
use crate::{BgrFrame, DetectOutcome, Detector, FrameError, METHOD_TEMPLATE_FALLBACK};

const PLATE_W_MM: f64 = 500.0;
const PLATE_H_MM: f64 = 600.0;
const MM_PER_PX: f64 = 0.5;

/// 100×80 px template = 50×40 mm at the plate scale.
fn template_png(tag: &str, seed: u64) -> std::path::PathBuf {
    write_temp_png(tag, &synthetic_logo(100, 80, seed))
}

fn logo_spec(name: &str, template: std::path::PathBuf, position_mm: [f64; 2]) -> LogoSpec {
    LogoSpec {
        name: name.into(),
        template_path: template,
        position_mm,
        angle_deg: 0.0,
        roi: RoiSpec {
            width_mm: 50.0,
            height_mm: 40.0,
            margin_factor: 1.2,
        },
        has_transparency: None,
        transparency_method: None,
    }
}

fn base_config(logos: Vec<LogoSpec>) -> DetectorConfig {
    DetectorConfig {
        plane: PlaneConfig {
            width_mm: PLATE_W_MM,
            height_mm: PLATE_H_MM,
            mm_per_px: MM_PER_PX,
            homography: None,
        },
        logos,
        thresholds: Thresholds {
            min_inliers: 10,
            ..Thresholds::default()
        },
        features: FeatureParams::default(),
        matching: MatchingParams::default(),
        ransac: RansacParams::default(),
        // Scenario tests opt in explicitly; the grid scan is the slow path.
        fallback: FallbackParams {
            enabled: false,
            ..FallbackParams::default()
        },
    }
}

/// Blank plate frame at the configured scale (1000×1200 px).
fn blank_plate() -> GrayImage {
    GrayImage::from_pixel(1000, 1200, image::Luma([235]))
}

fn detect_on(detector: &Detector, frame: &GrayImage) -> Vec<crate::LogoResult> {
    let buf = gray_to_bgr(frame);
    let bgr = BgrFrame::new(frame.width(), frame.height(), &buf).unwrap();
    detector.detect(&bgr).unwrap()
}

#[test]
fn perfect_alignment_is_within_a_millimetre() {
    let template = synthetic_logo(100, 80, 21);
    let path = write_temp_png("e2e_perfect", &template);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    let mut frame = blank_plate();
    paste_transformed(&mut frame, &template, 500.0, 600.0, 0.0, 1.0);
    let results = detect_on(&detector, &frame);

    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert_eq!(r.name, "front");
    assert!(r.found, "outcome: {:?}", r.outcome);
    assert_eq!(r.outcome, DetectOutcome::FoundPrimary);
    assert_eq!(r.method_used.as_deref(), Some("ORB+RANSAC"));
    assert!(r.error_mm.unwrap() < 1.0, "error {} mm", r.error_mm.unwrap());
    assert!(
        r.angle_error_deg.unwrap() < 1.0,
        "angle error {}",
        r.angle_error_deg.unwrap()
    );
    assert!(r.meets_position_tolerance && r.meets_angle_tolerance);
    assert!(r.inliers.unwrap() >= 10);
    assert!(r.reproj_error_px.unwrap() <= 3.0);
    let c = r.confidence.unwrap();
    assert!((0.0..=1.0).contains(&c));
    assert!(r.processing_time_ms > 0.0);
}

#[test]
fn five_millimetre_offset_is_found_but_out_of_tolerance() {
    let template = synthetic_logo(100, 80, 22);
    let path = write_temp_png("e2e_offset", &template);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    // Pasted at (255, 300) mm: 5 mm to the right of the expected centre.
    let mut frame = blank_plate();
    paste_transformed(&mut frame, &template, 510.0, 600.0, 0.0, 1.0);
    let results = detect_on(&detector, &frame);

    let r = &results[0];
    assert!(r.found);
    let err = r.error_mm.unwrap();
    assert!((4.5..=5.5).contains(&err), "error {err} mm");
    assert!(!r.meets_position_tolerance);
    assert!(r.meets_angle_tolerance);
}

#[test]
fn ten_degree_rotation_is_measured_and_flagged() {
    let template = synthetic_logo(100, 80, 23);
    let path = write_temp_png("e2e_rot", &template);
    let mut config = base_config(vec![logo_spec("front", path, [250.0, 300.0])]);
    config.fallback = FallbackParams {
        enabled: true,
        scales: vec![1.0],
        angles_deg: vec![-10.0, -5.0, 0.0, 5.0, 10.0],
        match_threshold: 0.5,
    };
    let detector = Detector::new(config).unwrap();

    let mut frame = blank_plate();
    paste_transformed(&mut frame, &template, 500.0, 600.0, 10.0, 1.0);
    let results = detect_on(&detector, &frame);

    let r = &results[0];
    assert!(r.found, "outcome: {:?}", r.outcome);
    let angle = r.angle_deg.unwrap();
    assert!((angle - 10.0).abs() < 1.5, "angle {angle}");
    // Tolerance is 5 degrees: found, but the operator must adjust.
    assert!(!r.meets_angle_tolerance);
}

#[test]
fn absent_logo_reports_not_found_without_error() {
    let path = template_png("e2e_absent", 24);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    let results = detect_on(&detector, &blank_plate());
    let r = &results[0];
    assert!(!r.found);
    assert!(r.position_mm.is_none());
    assert!(r.angle_deg.is_none());
    assert!(r.error_mm.is_none());
    assert!(r.confidence.is_none());
    assert!(r.inliers.is_none());
    assert!(r.method_used.is_none());
    assert!(r.processing_time_ms > 0.0);
    assert_eq!(r.outcome, DetectOutcome::TooFewMatches);
}

#[test]
fn scaled_and_rotated_instance_falls_back_to_template_matching() {
    let template = synthetic_logo(100, 80, 25);
    let path = write_temp_png("e2e_fallback", &template);
    let mut config = base_config(vec![logo_spec("front", path, [250.0, 300.0])]);
    // Force the primary path to fail regardless of match quality.
    config.thresholds.min_inliers = 10_000;
    config.fallback = FallbackParams {
        enabled: true,
        scales: vec![0.8, 0.9, 1.0, 1.1],
        angles_deg: vec![-10.0, -5.0, 0.0, 5.0, 10.0],
        match_threshold: 0.5,
    };
    let detector = Detector::new(config).unwrap();

    let mut frame = blank_plate();
    paste_transformed(&mut frame, &template, 500.0, 600.0, 7.0, 0.9);
    let results = detect_on(&detector, &frame);

    let r = &results[0];
    assert!(r.found, "outcome: {:?}", r.outcome);
    assert_eq!(r.outcome, DetectOutcome::FoundFallback);
    assert_eq!(r.method_used.as_deref(), Some(METHOD_TEMPLATE_FALLBACK));
    assert!(r.inliers.is_none());
    assert!(r.reproj_error_px.is_none());
    assert!(r.confidence.unwrap() > 0.5);
}

#[test]
fn two_logos_one_ok_one_needs_adjustment() {
    let chest = synthetic_logo(100, 80, 26);
    let sleeve = synthetic_logo(100, 80, 27);
    let chest_path = write_temp_png("e2e_two_chest", &chest);
    let sleeve_path = write_temp_png("e2e_two_sleeve", &sleeve);
    let detector = Detector::new(base_config(vec![
        logo_spec("pecho", chest_path, [150.0, 100.0]),
        logo_spec("manga_izq", sleeve_path, [350.0, 300.0]),
    ]))
    .unwrap();

    let mut frame = blank_plate();
    paste_transformed(&mut frame, &chest, 300.0, 200.0, 0.0, 1.0);
    // Sleeve logo sits 6 mm right of its expected position.
    paste_transformed(&mut frame, &sleeve, 712.0, 600.0, 0.0, 1.0);
    let results = detect_on(&detector, &frame);

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].name, "pecho");
    assert_eq!(results[1].name, "manga_izq");
    assert!(results[0].found && results[1].found);
    assert!(results[0].meets_position_tolerance);
    assert!(!results[1].meets_position_tolerance);
    let err = results[1].error_mm.unwrap();
    assert!((5.0..=7.0).contains(&err), "error {err} mm");
}

#[test]
fn found_results_satisfy_the_result_invariants() {
    let template = synthetic_logo(100, 80, 28);
    let path = write_temp_png("e2e_inv", &template);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    let mut frame = blank_plate();
    paste_transformed(&mut frame, &template, 500.0, 600.0, 0.0, 1.0);
    for r in detect_on(&detector, &frame) {
        if !r.found {
            continue;
        }
        let [x, y] = r.position_mm.unwrap();
        assert!(x > 0.0 && x < PLATE_W_MM && y > 0.0 && y < PLATE_H_MM);
        let a = r.angle_deg.unwrap();
        assert!(a > -180.0 && a <= 180.0);
        assert!((0.0..=1.0).contains(&r.confidence.unwrap()));
        assert!(r.error_mm.unwrap() >= 0.0);
        let ae = r.angle_error_deg.unwrap();
        assert!((0.0..=180.0).contains(&ae));
        assert_eq!(
            r.meets_position_tolerance,
            r.error_mm.unwrap() <= detector.config().thresholds.max_position_error_mm
        );
    }
}

#[test]
fn identical_inputs_and_seed_reproduce_identical_measurements() {
    let template = synthetic_logo(100, 80, 29);
    let path = write_temp_png("e2e_det", &template);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    let mut frame = blank_plate();
    paste_transformed(&mut frame, &template, 500.0, 600.0, 0.0, 1.0);
    let a = detect_on(&detector, &frame);
    let b = detect_on(&detector, &frame);

    for (ra, rb) in a.iter().zip(&b) {
        assert_eq!(ra.found, rb.found);
        assert_eq!(
            ra.position_mm.map(|p| [p[0].to_bits(), p[1].to_bits()]),
            rb.position_mm.map(|p| [p[0].to_bits(), p[1].to_bits()]),
        );
        assert_eq!(
            ra.angle_deg.map(f64::to_bits),
            rb.angle_deg.map(f64::to_bits)
        );
        assert_eq!(ra.inliers, rb.inliers);
        assert_eq!(
            ra.confidence.map(f64::to_bits),
            rb.confidence.map(f64::to_bits)
        );
    }
}

#[test]
fn per_call_homography_rectifies_a_translated_camera_frame() {
    let template = synthetic_logo(100, 80, 30);
    let path = write_temp_png("e2e_rect", &template);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    // Camera sees the plate shifted by (7, 5) px; the homography undoes it.
    let mut camera = GrayImage::from_pixel(1010, 1210, image::Luma([235]));
    paste_transformed(&mut camera, &template, 507.0, 605.0, 0.0, 1.0);
    let h = [[1.0, 0.0, -7.0], [0.0, 1.0, -5.0], [0.0, 0.0, 1.0]];

    let buf = gray_to_bgr(&camera);
    let bgr = BgrFrame::new(camera.width(), camera.height(), &buf).unwrap();
    let results = detector.detect_with_homography(&bgr, Some(&h)).unwrap();

    let r = &results[0];
    assert!(r.found, "outcome: {:?}", r.outcome);
    assert!(r.error_mm.unwrap() < 1.0, "error {} mm", r.error_mm.unwrap());
}

#[test]
fn roi_clipped_entirely_off_frame_is_reported_immediately() {
    let path = template_png("e2e_roioutside", 31);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    // A frame far smaller than the plate: the expected centre at
    // (500, 600) px lies beyond it entirely.
    let small = GrayImage::from_pixel(200, 200, image::Luma([235]));
    let results = detect_on(&detector, &small);
    let r = &results[0];
    assert!(!r.found);
    assert_eq!(r.outcome, DetectOutcome::RoiOutside);
}

#[test]
fn inspection_api_reports_pixel_geometry() {
    let path = template_png("e2e_inspect", 32);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    let positions = detector.expected_positions_px();
    assert_eq!(positions["front"], [500.0, 600.0]);
    // 50×40 mm ROI with margin 1.2 at 0.5 mm/px: 120×96 px window.
    assert_eq!(detector.roi_bounds_px("front"), Some([440, 552, 560, 648]));
    assert_eq!(detector.roi_bounds_px("missing"), None);
}

#[test]
fn invalid_frames_and_homographies_are_rejected_per_call() {
    let path = template_png("e2e_badframe", 33);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    assert!(matches!(
        BgrFrame::new(10, 10, &[0u8; 5]),
        Err(FrameError::InvalidFrame { .. })
    ));

    let frame = blank_plate();
    let buf = gray_to_bgr(&frame);
    let bgr = BgrFrame::new(frame.width(), frame.height(), &buf).unwrap();
    let singular = [[1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
    let err = detector
        .detect_with_homography(&bgr, Some(&singular))
        .unwrap_err();
    let FrameError::InvalidFrame { reason } = err;
    assert!(reason.contains("homography"), "reason: {reason}");
}

#[test]
fn results_serialise_to_flat_json_records() {
    let template = synthetic_logo(100, 80, 34);
    let path = write_temp_png("e2e_json", &template);
    let detector = Detector::new(base_config(vec![logo_spec(
        "front",
        path,
        [250.0, 300.0],
    )]))
    .unwrap();

    let mut frame = blank_plate();
    paste_transformed(&mut frame, &template, 500.0, 600.0, 0.0, 1.0);
    let results = detect_on(&detector, &frame);
    let json = serde_json::to_value(&results).unwrap();

    let rec = &json[0];
    assert_eq!(rec["name"], "front");
    assert_eq!(rec["found"], true);
    assert!(rec["position_mm"].is_array());
    assert!(rec["confidence"].as_f64().unwrap().is_finite());
    assert!(rec["processing_time_ms"].as_f64().unwrap() > 0.0);
    assert!(rec["meets_position_tolerance"].is_boolean());
}
