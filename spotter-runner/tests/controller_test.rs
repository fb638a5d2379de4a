// Run controller scenarios with static inputs and fake collaborators

use image::RgbImage;
use ndarray::{array, Array2, Array4};
use parking_lot::Mutex;
use spotter_core::{
    DetectionResult, EventKind, ImageSource, MemorySink, Moment, PipelineMode, ResultPublisher, RunState,
    TimingLog,
};
use spotter_eye::capability::ForwardPass;
use spotter_eye::software::SoftwareSettings;
use spotter_eye::{SoftwarePipeline, VisionError};
use spotter_runner::stages::{DetectionStages, StageError, HW_LAYERS, IMAGE_LOADING};
use spotter_runner::{timed, ExitReason, Frame, RunController, SoftwareStages, StaticFileSource};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct FixedNetwork {
    rows: Array2<f32>,
}

impl ForwardPass for FixedNetwork {
    fn forward(&mut self, _blob: &Array4<f32>) -> Result<Vec<Array2<f32>>, VisionError> {
        Ok(vec![self.rows.clone()])
    }
}

#[derive(Clone, Default)]
struct RecordingPublisher {
    published: Arc<Mutex<Vec<DetectionResult>>>,
    stop_after_publish: Option<RunState>,
}

impl ResultPublisher for RecordingPublisher {
    fn publish(&mut self, result: DetectionResult) -> spotter_core::Result<()> {
        self.published.lock().push(result);
        if let Some(state) = &self.stop_after_publish {
            state.set_running(false);
        }
        Ok(())
    }
}

/// Loads fine, then the accelerator stage fails
struct FaultyAccelerator;

impl DetectionStages for FaultyAccelerator {
    fn mode(&self) -> PipelineMode {
        PipelineMode::Hybrid
    }

    fn process(&mut self, _frame: &Frame, log: &mut TimingLog) -> Result<DetectionResult, StageError> {
        timed(log, &IMAGE_LOADING, || Ok::<_, VisionError>(()))?;
        timed(log, &HW_LAYERS, || {
            Err::<DetectionResult, _>(VisionError::AcceleratorFault("accel_infer returned 1".to_string()))
        })
    }
}

/// Always detects one person without touching the frame
struct AlwaysPerson;

impl DetectionStages for AlwaysPerson {
    fn mode(&self) -> PipelineMode {
        PipelineMode::Software
    }

    fn process(&mut self, _frame: &Frame, _log: &mut TimingLog) -> Result<DetectionResult, StageError> {
        DetectionResult::new(
            vec!["person".to_string()],
            vec![0.9],
            None,
            ImageSource::Inline(bytes_of(b"jpeg")),
        )
        .map_err(|source| StageError { stage: "fake", source })
    }
}

fn bytes_of(data: &'static [u8]) -> bytes::Bytes {
    bytes::Bytes::from_static(data)
}

fn write_frames(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            RgbImage::new(416, 416).save(&path).unwrap();
            path
        })
        .collect()
}

fn software_stages(rows: Array2<f32>, save_dir: Option<PathBuf>) -> Box<dyn DetectionStages> {
    let pipeline = SoftwarePipeline::new(
        Box::new(FixedNetwork { rows }),
        vec!["background".to_string(), "person".to_string()],
        SoftwareSettings::default(),
    );
    Box::new(SoftwareStages::new(pipeline, save_dir))
}

fn running() -> RunState {
    let state = RunState::new();
    state.set_running(true);
    state
}

#[test]
fn software_cycles_publish_and_exhaust_static_input() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_frames(input.path(), &["b.png", "a.png"]);

    let sink = MemorySink::new();
    let publisher = RecordingPublisher::default();
    let state = running();
    let mut controller = RunController::new(
        software_stages(
            array![[0.5, 0.5, 0.2, 0.2, 0.95, 0.1, 0.9]],
            Some(output.path().to_path_buf()),
        ),
        Box::new(StaticFileSource::from_dir(input.path()).unwrap()),
        Box::new(publisher.clone()),
        TimingLog::new("software-detection", false, Some(Box::new(sink.clone()))),
        state.clone(),
    );

    assert_eq!(controller.run(), ExitReason::InputExhausted);
    assert!(!state.is_running());
    assert_eq!(controller.cycles(), 2);
    assert_eq!(controller.timing().run_index(), 2);

    let published = publisher.published.lock();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].labels(), &["person".to_string()]);
    assert_eq!(published[0].boxes().unwrap()[0].to_array(), [166, 166, 83, 83]);
    let first = published[0].source_path().unwrap();
    assert_eq!(first.file_name().unwrap(), "a_sw_detection.png");
    assert!(first.is_file());

    let rows = sink.snapshot();
    assert_eq!(rows.len(), 18);
    let durations: Vec<&str> = rows
        .iter()
        .filter(|e| e.kind == EventKind::Duration && e.run_index == 0)
        .filter_map(|e| e.label.as_deref())
        .collect();
    assert_eq!(durations, ["Image Loading", "Apply SW Conv Layers", "Draw Detection Boxes"]);
    assert!(rows.iter().any(|e| e.run_index == 1));
}

#[test]
fn empty_detection_set_is_never_published() {
    let input = tempfile::tempdir().unwrap();
    write_frames(input.path(), &["empty.png"]);

    let publisher = RecordingPublisher::default();
    let mut controller = RunController::new(
        software_stages(array![[0.5, 0.5, 0.2, 0.2, 0.9, 0.1, 0.2]], None),
        Box::new(StaticFileSource::from_dir(input.path()).unwrap()),
        Box::new(publisher.clone()),
        TimingLog::new("software-detection", false, None),
        running(),
    );

    assert_eq!(controller.run(), ExitReason::InputExhausted);
    assert_eq!(controller.cycles(), 1);
    assert!(publisher.published.lock().is_empty());
}

#[test]
fn stage_failure_records_sentinel_and_continues() {
    let sink = MemorySink::new();
    let publisher = RecordingPublisher::default();
    let mut controller = RunController::new(
        Box::new(FaultyAccelerator),
        Box::new(StaticFileSource::new(vec!["/frames/1.jpg".into(), "/frames/2.jpg".into()])),
        Box::new(publisher.clone()),
        TimingLog::new("hybrid-detection", false, Some(Box::new(sink.clone()))),
        running(),
    );

    assert_eq!(controller.run(), ExitReason::InputExhausted);
    assert_eq!(controller.cycles(), 2);
    assert!(publisher.published.lock().is_empty());

    let rows = sink.snapshot();
    let aborted: Vec<_> = rows.iter().filter(|e| e.moment == Moment::Aborted).collect();
    assert_eq!(aborted.len(), 2);
    assert_eq!(aborted[0].run_index, 0);
    assert_eq!(aborted[1].run_index, 1);
    assert_eq!(aborted[0].label.as_deref(), Some("Apply HW Conv Layers 1-7"));
    assert!(aborted[0].to_csv_row().ends_with(",-1,Apply HW Conv Layers 1-7"));
    assert!(!controller.timing().has_open_trigger());
}

#[test]
fn stop_signal_ends_loop_after_current_image() {
    let state = running();
    let publisher = RecordingPublisher {
        stop_after_publish: Some(state.clone()),
        ..RecordingPublisher::default()
    };
    let mut controller = RunController::new(
        Box::new(AlwaysPerson),
        Box::new(StaticFileSource::new(vec!["/f/1.jpg".into(), "/f/2.jpg".into(), "/f/3.jpg".into()])),
        Box::new(publisher.clone()),
        TimingLog::new("software-detection", false, None),
        state,
    )
    .with_capture_interval(Some(Duration::from_secs(60)))
    .with_poll_interval(Duration::from_millis(5));

    let shutdown = controller.shutdown_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        shutdown.store(true, Ordering::Release);
    });

    assert_eq!(controller.run(), ExitReason::Shutdown);
    stopper.join().unwrap();
    assert_eq!(controller.cycles(), 1);
    assert_eq!(publisher.published.lock().len(), 1);
}

#[test]
fn idle_controller_honours_shutdown() {
    let mut controller = RunController::new(
        Box::new(AlwaysPerson),
        Box::new(StaticFileSource::new(vec!["/f/1.jpg".into()])),
        Box::new(RecordingPublisher::default()),
        TimingLog::new("software-detection", false, None),
        RunState::new(),
    )
    .with_poll_interval(Duration::from_millis(5));

    controller.shutdown_handle().store(true, Ordering::Release);
    assert_eq!(controller.run(), ExitReason::Shutdown);
    assert_eq!(controller.cycles(), 0);
}

#[test]
fn continuous_mode_runs_without_waiting() {
    let publisher = RecordingPublisher::default();
    let mut controller = RunController::new(
        Box::new(AlwaysPerson),
        Box::new(StaticFileSource::new((0..5).map(|i| format!("/f/{}.jpg", i).into()).collect())),
        Box::new(publisher.clone()),
        TimingLog::new("software-detection", false, None),
        running(),
    )
    .with_capture_interval(None);

    let started = std::time::Instant::now();
    assert_eq!(controller.run(), ExitReason::InputExhausted);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(publisher.published.lock().len(), 5);
}
