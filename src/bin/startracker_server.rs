// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info};

use startracker::bus::{BusSurface, CaptureSettings, FilterSettings, OrientationRecord};
use startracker::camera::{
    AbstractCamera, MockCamera, StarCamera, CAMERA_BOOT_LOCKOUT, MAX_COLS, MAX_ROWS,
};
use startracker::image_sink::ImageSink;
use startracker::node::{BusNode, LocalNode};
use startracker::solver::Solver;
use startracker::state::{ServiceStatus, StateMachine};
use startracker::track_engine::{TrackEngine, BOOT_SETTLE};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum MockHw {
    /// Replace the detector with a simulated one.
    Camera,
    /// Also suppress host power-state changes.
    All,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run against simulated hardware.
    #[arg(long, value_enum)]
    mock_hw: Option<MockHw>,

    /// Directory receiving archival captures before fread-cache handoff.
    #[arg(long, default_value = "/tmp")]
    cache_dir: PathBuf,

    /// Filename keyword for archival captures.
    #[arg(long, default_value = "capture")]
    keyword: String,

    /// Calibrated median dark frame for the solver.
    #[arg(long)]
    median_image: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    let camera: Arc<dyn AbstractCamera> = if args.mock_hw.is_some() {
        info!("mocking camera");
        Arc::new(MockCamera::new(MAX_ROWS, MAX_COLS, CAMERA_BOOT_LOCKOUT))
    } else {
        Arc::new(StarCamera::new(CAMERA_BOOT_LOCKOUT))
    };

    let node: Arc<dyn BusNode> = match LocalNode::new(args.cache_dir.clone()) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("cannot set up capture cache directory: {}", e);
            std::process::exit(1);
        }
    };

    let machine = Arc::new(StateMachine::new());

    // Catalogue construction is the slow part of solver bring-up; a failure
    // here leaves the service alive in ERROR so the flight computer can
    // observe it and command OFF.
    let median_dark = match &args.median_image {
        Some(path) => match image::open(path) {
            Ok(img) => Some(img.to_rgb8()),
            Err(e) => {
                error!("cannot load median dark frame {}: {}", path.display(), e);
                machine.commit(ServiceStatus::Error);
                None
            }
        },
        None => None,
    };
    let solver = Arc::new(Solver::new(Box::new(sim::SimCatalog::new()), median_dark));

    let capture = Arc::new(CaptureSettings::default());
    let filter = Arc::new(FilterSettings::default());
    let orientation = Arc::new(Mutex::new(OrientationRecord::default()));
    let latest_frame = Arc::new(Mutex::new(None));
    let sink = Arc::new(ImageSink::new(
        node.clone(),
        args.cache_dir.clone(),
        args.keyword.clone(),
    ));

    // The handles the host node runtime dispatches SDO traffic to.
    let bus = BusSurface::new(
        machine.clone(),
        camera.clone(),
        capture.clone(),
        filter.clone(),
        orientation.clone(),
        latest_frame.clone(),
        /*manage_cpufreq=*/ args.mock_hw != Some(MockHw::All),
    );

    let mut engine = TrackEngine::new(
        machine.clone(),
        camera,
        solver,
        sink,
        node,
        capture,
        filter,
        orientation,
        latest_frame,
        BOOT_SETTLE,
    );
    engine.start();
    info!("star tracker payload running");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::Relaxed);
        })
        .expect("Error setting Ctrl-C handler");
    }

    loop {
        if interrupted.load(Ordering::Relaxed) {
            info!("interrupt received; stopping");
            break;
        }
        if machine.status() == ServiceStatus::Off {
            info!("status is OFF; stopping");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    engine.stop();
    bus.on_stop();
}

mod sim {
    // Ground-test stand-in for the attitude identification library. It
    // carries no sky model, so matches never clear the probability gate;
    // a flight build links the real catalogue behind the same trait.
    use canonical_error::{not_found_error, CanonicalError};
    use startracker::solver::{ConstellationMatch, ImageStar, StarCatalog};

    pub struct SimCatalog {}

    impl SimCatalog {
        pub fn new() -> Self {
            SimCatalog {}
        }
    }

    impl StarCatalog for SimCatalog {
        fn calibration_size(&self) -> (u32, u32) {
            (startracker::camera::MAX_COLS, startracker::camera::MAX_ROWS)
        }

        fn detection_threshold(&self) -> f64 {
            40.0
        }

        fn required_stars(&self) -> usize {
            5
        }

        fn max_false_stars(&self) -> usize {
            8
        }

        fn match_sky(
            &self,
            _stars: &[ImageStar],
        ) -> Result<ConstellationMatch, CanonicalError> {
            Err(not_found_error("simulated catalogue has no sky model"))
        }

        fn match_near(
            &self,
            _coarse: &ConstellationMatch,
            _stars: &[ImageStar],
        ) -> Result<ConstellationMatch, CanonicalError> {
            Err(not_found_error("simulated catalogue has no sky model"))
        }
    }
}
