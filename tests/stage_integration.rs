//! End-to-end stage tests against the scripted VXM controller.
//!
//! Each test drives a `StageController` over `mock_serial` and asserts the
//! exact command lines the controller would see on the wire.

use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use vxm_stage::{
    mock_serial::{self, MockDeviceHarness},
    Axis, AxisState, PollPolicy, StageController, StageError, StageSettings, Unit, Velocity,
};

/// Helper to create a stage with fast polling and no settle delay
fn create_test_stage() -> (Arc<StageController>, MockDeviceHarness) {
    let (port, harness) = mock_serial::new();
    let settings = StageSettings {
        read_timeout: Duration::from_millis(200),
        settle_delay: Duration::ZERO,
        poll: PollPolicy::unbounded(Duration::from_millis(1)),
        default_velocity: Velocity::default(),
    };
    (
        Arc::new(StageController::with_port(Box::new(port), settings)),
        harness,
    )
}

#[tokio::test]
async fn test_one_inch_move_on_x() {
    let (stage, mut harness) = create_test_stage();

    let task = tokio::spawn({
        let stage = stage.clone();
        async move { stage.move_relative(Axis::X, 1.0, Unit::Inches).await }
    });

    harness.expect_command("E,C,I1M5080,R").await;
    harness.expect_and_respond("V", "B").await;
    harness.expect_and_respond("V", "R").await;

    assert_eq!(assert_ok!(task.await.unwrap()), 5080);
    harness.assert_no_writes();
}

#[tokio::test]
async fn test_full_session() {
    let (stage, mut harness) = create_test_stage();

    let task = tokio::spawn({
        let stage = stage.clone();
        async move {
            stage.initialize().await?;
            stage.home_all().await?;
            stage.move_relative(Axis::Y, 2.0, Unit::Inches).await?;
            let reading = stage.query_position(Axis::Y, Unit::Inches).await?;
            stage.close().await?;
            Ok::<_, StageError>(reading)
        }
    });

    for motor in 1..=3 {
        harness.expect_command(&format!("E,C,S{motor}M2000,R")).await;
    }
    for motor in 1..=3 {
        harness.expect_command(&format!("E,C,IA{motor}M0,R")).await;
        harness.expect_and_respond("V", "R").await;
    }
    harness.expect_command("E,C,I2M10160,R").await;
    harness.expect_and_respond("V", "J").await;
    harness.expect_and_respond("V", "R").await;
    harness.expect_and_respond("Y", "Y+0010160").await;

    let reading = assert_ok!(task.await.unwrap());
    assert_eq!(reading.axis, Axis::Y);
    assert_eq!(reading.steps, 10160);
    assert!((reading.value - 2.0).abs() < 1e-9);
    assert_eq!(reading.to_string(), "Y Position: 2.000000in");

    assert!(stage.is_closed().await);
    harness.assert_no_writes();
}

#[tokio::test]
async fn test_position_report_in_millimeters() {
    let (stage, mut harness) = create_test_stage();

    let task = tokio::spawn({
        let stage = stage.clone();
        async move { stage.query_all_positions(Unit::Millimeters).await }
    });

    harness.expect_and_respond("X", "X+0000200").await;
    harness.expect_and_respond("Y", "Y-0000001").await;
    harness.expect_and_respond("Z", "Z+0000000").await;

    let (x, y, z) = assert_ok!(task.await.unwrap());
    assert!((x - 1.0).abs() < 1e-9);
    assert!((y + 0.005).abs() < 1e-9);
    assert_eq!(z, 0.0);
}

#[tokio::test]
async fn test_stale_reply_is_not_mistaken_for_position() {
    let (stage, mut harness) = create_test_stage();

    // A late readiness reply left over from an earlier exchange
    harness.respond_line("R").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let task = tokio::spawn({
        let stage = stage.clone();
        async move { stage.query_position(Axis::Z, Unit::Millimeters).await }
    });

    harness.expect_and_respond("Z", "Z+0000400").await;

    let reading = assert_ok!(task.await.unwrap());
    assert_eq!(reading.steps, 400);
}

#[tokio::test]
async fn test_sequences_do_not_interleave() {
    let (stage, mut harness) = create_test_stage();

    let homing = tokio::spawn({
        let stage = stage.clone();
        async move { stage.home_all().await }
    });
    harness.expect_command("E,C,IA1M0,R").await;

    let query = tokio::spawn({
        let stage = stage.clone();
        async move { stage.query_position(Axis::X, Unit::Millimeters).await }
    });

    harness.expect_and_respond("V", "R").await;
    harness.expect_command("E,C,IA2M0,R").await;
    harness.expect_and_respond("V", "R").await;
    harness.expect_command("E,C,IA3M0,R").await;
    harness.expect_and_respond("V", "R").await;
    assert_ok!(homing.await.unwrap());

    harness.expect_and_respond("X", "X+0000000").await;
    assert_ok!(query.await.unwrap());
}

#[tokio::test]
async fn test_bounded_policy_gives_up() {
    let (port, mut harness) = mock_serial::new();
    let settings = StageSettings {
        read_timeout: Duration::from_millis(200),
        settle_delay: Duration::ZERO,
        poll: PollPolicy::unbounded(Duration::from_millis(1)).with_max_attempts(3),
        default_velocity: Velocity::default(),
    };
    let stage = Arc::new(StageController::with_port(Box::new(port), settings));

    let task = tokio::spawn({
        let stage = stage.clone();
        async move { stage.move_relative(Axis::Z, 0.5, Unit::Millimeters).await }
    });

    harness.expect_command("E,C,I3M100,R").await;
    for _ in 0..3 {
        harness.expect_and_respond("V", "B").await;
    }

    let err = assert_err!(task.await.unwrap());
    assert!(matches!(err, StageError::NotReady { attempts: 3, .. }));
    assert!(err.is_recoverable());
    assert_eq!(stage.axis(Axis::Z).state(), AxisState::Idle);
}

#[tokio::test]
async fn test_disposed_stage_rejects_everything() {
    let (stage, mut harness) = create_test_stage();

    assert_ok!(stage.close().await);

    assert!(matches!(
        stage.initialize().await,
        Err(StageError::ChannelClosed)
    ));
    assert!(matches!(
        stage.query_position(Axis::X, Unit::Inches).await,
        Err(StageError::ChannelClosed)
    ));
    assert!(matches!(
        stage.axis(Axis::Z).poll_until_ready(PollPolicy::default()).await,
        Err(StageError::ChannelClosed)
    ));
    assert_ok!(stage.close().await);
    harness.assert_no_writes();
}

#[tokio::test]
async fn test_harness_disconnect_surfaces_as_closed() {
    let (stage, harness) = create_test_stage();
    drop(harness);

    let err = assert_err!(stage.query_position(Axis::X, Unit::Millimeters).await);
    assert!(matches!(err, StageError::Io(_) | StageError::ChannelClosed));
}
