// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use log::{debug, error, info, warn};

use crate::bus::{
    CaptureSettings, FilterSettings, OrientationRecord, TPDO_ORIENTATION, TPDO_TIMESTAMP,
};
use crate::camera::{AbstractCamera, Frame};
use crate::filter;
use crate::image_sink::ImageSink;
use crate::node::BusNode;
use crate::solver::Solver;
use crate::state::{ServiceStatus, StateMachine};

/// Settle time before the loop commits BOOT -> STANDBY, measured from
/// process start. Independent of the camera's own boot lockout, which
/// happens to be of similar magnitude.
pub const BOOT_SETTLE: Duration = Duration::from_secs(70);

/// Per image slot in a capture-only session, how many frames may be burned
/// on filter rejections before the session is abandoned.
pub const MAX_CAPTURE_RETRIES: u32 = 10;

// Cooperative pause when the loop has nothing to do.
const IDLE_TICK: Duration = Duration::from_millis(100);

// Pause between retries of one image slot, to avoid starving the CPU.
const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Hosts the periodic service loop on a worker thread and dispatches to the
/// per-status handlers. The loop is the only writer of time-driven and
/// fault-driven status transitions.
pub struct TrackEngine {
    shared: Arc<EngineShared>,

    // Executes worker().
    worker_thread: Option<thread::JoinHandle<()>>,

    // Set by stop(); the worker thread exits when it sees this.
    stop_request: Arc<AtomicBool>,
}

// Collaborators and published buffers shared with the worker thread.
struct EngineShared {
    machine: Arc<StateMachine>,
    camera: Arc<dyn AbstractCamera>,
    solver: Arc<Solver>,
    sink: Arc<ImageSink>,
    node: Arc<dyn BusNode>,
    capture: Arc<CaptureSettings>,
    filter: Arc<FilterSettings>,
    orientation: Arc<Mutex<OrientationRecord>>,
    latest_frame: Arc<Mutex<Option<Frame>>>,
    started_at: Instant,
    boot_settle: Duration,
}

impl Drop for TrackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TrackEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: Arc<StateMachine>,
        camera: Arc<dyn AbstractCamera>,
        solver: Arc<Solver>,
        sink: Arc<ImageSink>,
        node: Arc<dyn BusNode>,
        capture: Arc<CaptureSettings>,
        filter: Arc<FilterSettings>,
        orientation: Arc<Mutex<OrientationRecord>>,
        latest_frame: Arc<Mutex<Option<Frame>>>,
        boot_settle: Duration,
    ) -> Self {
        TrackEngine {
            shared: Arc::new(EngineShared {
                machine,
                camera,
                solver,
                sink,
                node,
                capture,
                filter,
                orientation,
                latest_frame,
                started_at: Instant::now(),
                boot_settle,
            }),
            worker_thread: None,
            stop_request: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&mut self) {
        if self.worker_thread.is_some() {
            return;
        }
        self.stop_request.store(false, Ordering::Relaxed);
        let shared = self.shared.clone();
        let stop_request = self.stop_request.clone();
        self.worker_thread = Some(thread::spawn(move || {
            debug!("Starting track engine");
            while !stop_request.load(Ordering::Relaxed) {
                Self::tick(&shared);
            }
            debug!("Stopping track engine");
        }));
    }

    /// Requests worker exit and waits for the current handler pass to run to
    /// completion (bounded by one frame plus one solve).
    pub fn stop(&mut self) {
        self.stop_request.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }

    // One pass of the service loop.
    fn tick(shared: &EngineShared) {
        match shared.machine.status() {
            ServiceStatus::Boot => {
                if shared.started_at.elapsed() >= shared.boot_settle {
                    shared.machine.commit(ServiceStatus::Standby);
                } else {
                    thread::sleep(IDLE_TICK);
                }
            }
            ServiceStatus::StarTrack => Self::star_track(shared),
            ServiceStatus::CaptureOnly => Self::capture_only(shared),
            _ => thread::sleep(IDLE_TICK),
        }
    }

    // Star track once: one frame, one solve attempt, publish on success.
    fn star_track(shared: &EngineShared) {
        let delay_ms = shared.capture.delay_ms.load(Ordering::Relaxed);

        // The published timestamp belongs to the start of the exposure.
        let scet = seconds_since_midnight();
        let frame = match shared.camera.capture(/*color=*/ true) {
            Ok(frame) => frame,
            Err(e) => {
                error!("capture failed while star tracking: {}", e);
                shared.machine.commit(ServiceStatus::Error);
                return;
            }
        };
        *shared.latest_frame.lock().unwrap() = Some(frame.clone());

        match shared.solver.solve(&frame) {
            Ok((dec, ra, roll)) => {
                {
                    let mut record = shared.orientation.lock().unwrap();
                    record.right_ascension = ra as i32;
                    record.declination = dec as i32;
                    record.roll = roll as i32;
                    record.timestamp = scet;
                }
                debug!("solved: ra:{:.2} dec:{:.2} roll:{:.2}", ra, dec, roll);
                // The record is published before the telemetry that
                // announces it.
                for tpdo in [TPDO_ORIENTATION, TPDO_TIMESTAMP] {
                    if let Err(e) = shared.node.send_tpdo(tpdo) {
                        warn!("TPDO {} emission failed: {}", tpdo, e);
                    }
                }
            }
            // A failed solve is routine (daylight, slew, clouds on the
            // ground rig); keep tracking.
            Err(e) => info!("no attitude solution for this frame: {}", e),
        }

        if delay_ms == 0 {
            // Single-shot mode.
            shared.machine.commit(ServiceStatus::Standby);
        } else {
            thread::sleep(Duration::from_millis(delay_ms as u64));
        }
    }

    // Capture images until the time budget or the image count runs out.
    fn capture_only(shared: &EngineShared) {
        let delay = Duration::from_millis(shared.capture.delay_ms.load(Ordering::Relaxed) as u64);
        let duration =
            Duration::from_secs(shared.capture.duration_s.load(Ordering::Relaxed) as u64);
        let max_images = shared.capture.max_images.load(Ordering::Relaxed);
        let save_captures = shared.capture.save_captures.load(Ordering::Relaxed);
        let filter_enabled = shared.filter.enable.load(Ordering::Relaxed);
        let thresholds = shared.filter.snapshot();

        let session_start = Instant::now();
        let mut taken = 0u32;
        while session_start.elapsed() < duration && (max_images == 0 || taken < max_images) {
            // One image slot: burn retries on filter rejections, up to the
            // limit. A camera fault ends the whole session in ERROR.
            let mut accepted: Option<Frame> = None;
            for _attempt in 0..MAX_CAPTURE_RETRIES {
                match shared.camera.capture(/*color=*/ true) {
                    Ok(frame) => {
                        if filter_enabled && !filter::frame_passes(&frame, &thresholds) {
                            thread::sleep(RETRY_PAUSE);
                            continue;
                        }
                        accepted = Some(frame);
                        break;
                    }
                    Err(e) => {
                        error!("capture failed during capture session: {}", e);
                        shared.machine.commit(ServiceStatus::Error);
                        return;
                    }
                }
            }
            let Some(frame) = accepted else {
                warn!(
                    "filter rejected {} consecutive frames; ending session",
                    MAX_CAPTURE_RETRIES
                );
                break;
            };

            shared
                .capture
                .last_capture_time
                .store(seconds_since_midnight(), Ordering::Relaxed);
            *shared.latest_frame.lock().unwrap() = Some(frame.clone());
            taken += 1;
            if save_captures {
                if let Err(e) = shared.sink.save_archival(&frame) {
                    warn!("could not archive capture: {}", e);
                }
            }
            thread::sleep(delay);
        }

        if taken == 0 {
            info!("no images taken, check capture settings and filter");
        }
        shared.machine.commit(ServiceStatus::Standby);
    }
}

/// Spacecraft elapsed time encoding of "now": seconds since UTC midnight.
pub fn seconds_since_midnight() -> u32 {
    Utc::now().time().num_seconds_from_midnight()
}

// mod tests.
