//! Run controller: drives acquisition, detection and publishing while the
//! control channel says so.

use crate::acquisition::FrameSource;
use crate::stages::DetectionStages;
use spotter_core::{ResultPublisher, RunState, TimingLog};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Why [`RunController::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested
    Shutdown,
    /// The static input list was fully processed
    InputExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Completed,
    Exhausted,
}

pub struct RunController {
    stages: Box<dyn DetectionStages>,
    source: Box<dyn FrameSource>,
    publisher: Box<dyn ResultPublisher>,
    log: TimingLog,
    run_state: RunState,
    shutdown: Arc<AtomicBool>,
    capture_interval: Option<Duration>,
    poll_interval: Duration,
    cycles: u64,
}

impl RunController {
    pub fn new(
        stages: Box<dyn DetectionStages>,
        source: Box<dyn FrameSource>,
        publisher: Box<dyn ResultPublisher>,
        log: TimingLog,
        run_state: RunState,
    ) -> Self {
        Self {
            stages,
            source,
            publisher,
            log,
            run_state,
            shutdown: Arc::new(AtomicBool::new(false)),
            capture_interval: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cycles: 0,
        }
    }

    /// Sleep between cycles; `None` loops continuously
    pub fn with_capture_interval(mut self, interval: Option<Duration>) -> Self {
        self.capture_interval = interval;
        self
    }

    /// How often the run and shutdown flags are checked while idle
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Setting the returned flag makes [`run`](Self::run) return at the next
    /// iteration boundary.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn timing(&self) -> &TimingLog {
        &self.log
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Loop until shutdown or until a static input list runs out.
    pub fn run(&mut self) -> ExitReason {
        info!("Run controller ready ({} pipeline), waiting for run signal", self.stages.mode().as_str());
        loop {
            if self.shutdown_requested() {
                return ExitReason::Shutdown;
            }
            if !self.run_state.is_running() {
                std::thread::sleep(self.poll_interval);
                continue;
            }

            info!("Starting detection");
            while self.run_state.is_running() && !self.shutdown_requested() {
                if self.run_cycle() == Cycle::Exhausted {
                    info!("All static images processed");
                    self.run_state.set_running(false);
                    return ExitReason::InputExhausted;
                }
                debug!("Loop done");

                if !self.run_state.is_running() {
                    break;
                }
                if let Some(interval) = self.capture_interval {
                    debug!("Waiting {:?} before the next cycle", interval);
                    self.wait(interval);
                }
            }
            info!("Stopping detection");
        }
    }

    /// One acquire, detect, publish iteration.
    fn run_cycle(&mut self) -> Cycle {
        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Cycle::Exhausted,
            Err(e) => {
                error!(stage = "Image Acquisition", "{}", e);
                self.log.next_index();
                return Cycle::Completed;
            }
        };

        match self.stages.process(&frame, &mut self.log) {
            Ok(result) if result.is_empty() => info!("Nothing detected"),
            Ok(result) => {
                if let Err(e) = self.publisher.publish(result) {
                    error!(stage = "Publish", "{}", e);
                }
            }
            Err(e) => error!(stage = e.stage, image = ?frame.path(), "{}", e.source),
        }

        self.cycles += 1;
        self.log.next_index();
        Cycle::Completed
    }

    /// Sleep in poll sized slices so a stop or shutdown cuts the wait short
    fn wait(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline || !self.run_state.is_running() || self.shutdown_requested() {
                return;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
