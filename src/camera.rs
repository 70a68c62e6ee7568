// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use canonical_error::{
    failed_precondition_error, internal_error, unavailable_error, CanonicalError,
};
use image::{GrayImage, Rgb, RgbImage};
use log::{error, info, warn};

/// Detector geometry at full resolution.
pub const MAX_COLS: u32 = 1280;
pub const MAX_ROWS: u32 = 960;

/// Thermal/optical settle time of the sensor, measured from process start.
/// Captures are refused until this has elapsed and `unlock()` has run.
pub const CAMERA_BOOT_LOCKOUT: Duration = Duration::from_secs(90);

const CAPTURE_PATH: &str = "/dev/prucam";
const CONTEXT_SETTINGS_DIR: &str = "/sys/devices/platform/prucam/context_settings";
const AUTO_EXPOSURE_ATTR: &str = "/sys/devices/platform/prucam/auto_exposure_settings/ae_enable";
const MODULE_NAME: &str = "prucam";
const MODULE_SRC_GLOB: &str = "/usr/src/prucam*";

/// A single capture. `Gray` is the raw mosaic as read from the detector;
/// `Rgb` is the demosaiced image. Frames are never mutated after capture.
#[derive(Clone)]
pub enum Frame {
    Gray(GrayImage),
    Rgb(RgbImage),
}

impl Frame {
    /// (width, height) in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Frame::Gray(img) => img.dimensions(),
            Frame::Rgb(img) => img.dimensions(),
        }
    }

    pub fn to_gray(&self) -> GrayImage {
        match self {
            Frame::Gray(img) => img.clone(),
            Frame::Rgb(img) => image::imageops::grayscale(img),
        }
    }

    pub fn to_rgb(&self) -> RgbImage {
        match self {
            Frame::Gray(img) => image::DynamicImage::ImageLuma8(img.clone()).to_rgb8(),
            Frame::Rgb(img) => img.clone(),
        }
    }
}

/// Readiness of the capture hardware. `Running` never reverts to `Lockout`
/// without a full process restart; `NotFound` and `Error` are terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CameraState {
    Lockout = 0,
    Running = 1,
    NotFound = 2,
    Error = 3,
}

// Readiness is written by the one-shot unlock thread and by nobody else;
// an atomic cell is all the synchronization required.
pub(crate) struct CameraStateCell(AtomicU8);

impl CameraStateCell {
    fn new(state: CameraState) -> Self {
        CameraStateCell(AtomicU8::new(state as u8))
    }

    fn get(&self) -> CameraState {
        match self.0.load(Ordering::Relaxed) {
            0 => CameraState::Lockout,
            1 => CameraState::Running,
            2 => CameraState::NotFound,
            _ => CameraState::Error,
        }
    }

    fn set(&self, state: CameraState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }
}

pub trait AbstractCamera: Send + Sync {
    /// Acquires a single frame. Blocking, not cancellable mid-read; callers
    /// must budget a frame time. With `color` the raw mosaic is demosaiced.
    /// Fails with FailedPrecondition while the camera is not `Running`.
    fn capture(&self, color: bool) -> Result<Frame, CanonicalError>;

    /// (rows, cols) of the frames this camera produces.
    fn dimensions(&self) -> (u32, u32);

    fn state(&self) -> CameraState;
}

/// The flight detector behind its kernel capture driver. Construction starts
/// a one-shot readiness thread which sleeps out the remainder of the boot
/// lockout and then brings the hardware up.
pub struct StarCamera {
    state: Arc<CameraStateCell>,
    geometry: Arc<Mutex<(u32, u32)>>, // (rows, cols)
}

impl StarCamera {
    pub fn new(unlock_delay: Duration) -> Self {
        let camera = StarCamera {
            state: Arc::new(CameraStateCell::new(CameraState::Lockout)),
            geometry: Arc::new(Mutex::new((MAX_ROWS, MAX_COLS))),
        };
        let state = camera.state.clone();
        let geometry = camera.geometry.clone();
        thread::spawn(move || {
            thread::sleep(unlock_delay);
            unlock(&state, &geometry);
        });
        camera
    }
}

impl AbstractCamera for StarCamera {
    fn capture(&self, color: bool) -> Result<Frame, CanonicalError> {
        let state = self.state.get();
        if state != CameraState::Running {
            return Err(failed_precondition_error(
                format!("camera not ready; state is {:?}", state).as_str(),
            ));
        }
        let (rows, cols) = *self.geometry.lock().unwrap();
        let mut buf = vec![0u8; (rows * cols) as usize];
        // A device fault here is a hardware fault; readiness goes terminal.
        let mut device = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(CAPTURE_PATH)
            .map_err(|e| {
                self.state.set(CameraState::Error);
                unavailable_error(format!("cannot open {}: {}", CAPTURE_PATH, e).as_str())
            })?;
        device.read_exact(&mut buf).map_err(|e| {
            self.state.set(CameraState::Error);
            unavailable_error(format!("short read from {}: {}", CAPTURE_PATH, e).as_str())
        })?;
        let mosaic = GrayImage::from_raw(cols, rows, buf).unwrap();
        if color {
            Ok(Frame::Rgb(demosaic_bggr(&mosaic)))
        } else {
            Ok(Frame::Gray(mosaic))
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        *self.geometry.lock().unwrap()
    }

    fn state(&self) -> CameraState {
        self.state.get()
    }
}

// Brings the hardware up at the end of the boot lockout: makes sure the
// capture kernel module is inserted, checks the device node, reads the frame
// geometry from sysfs and enables sensor auto-exposure. Every failure here
// is terminal for this process.
fn unlock(state: &CameraStateCell, geometry: &Mutex<(u32, u32)>) {
    let modules = match fs::read_to_string("/proc/modules") {
        Ok(contents) => contents,
        Err(e) => {
            error!("cannot read module list: {}", e);
            state.set(CameraState::Error);
            return;
        }
    };
    if !modules
        .lines()
        .any(|line| line.split_whitespace().next() == Some(MODULE_NAME))
    {
        if let Err(e) = install_kernel_module() {
            error!("error building/inserting kernel module: {}", e);
            state.set(CameraState::Error);
            return;
        }
    }

    if !Path::new(CAPTURE_PATH).exists() {
        error!("could not find capture path {}", CAPTURE_PATH);
        state.set(CameraState::NotFound);
        return;
    }

    let rows = read_context_setting("y_size");
    let cols = read_context_setting("x_size");
    match (rows, cols) {
        (Ok(rows), Ok(cols)) => {
            *geometry.lock().unwrap() = (rows, cols);
        }
        (rows, cols) => {
            error!("cannot read frame geometry: {:?} {:?}", rows, cols);
            state.set(CameraState::Error);
            return;
        }
    }

    if let Err(e) = fs::write(AUTO_EXPOSURE_ATTR, "1") {
        error!("cannot enable auto-exposure: {}", e);
        state.set(CameraState::Error);
        return;
    }

    state.set(CameraState::Running);
    let (rows, cols) = *geometry.lock().unwrap();
    info!("camera unlocked; frame geometry {}x{}", rows, cols);
}

fn read_context_setting(name: &str) -> Result<u32, CanonicalError> {
    let path = format!("{}/{}", CONTEXT_SETTINGS_DIR, name);
    let contents = fs::read_to_string(&path)
        .map_err(|e| unavailable_error(format!("cannot read {}: {}", path, e).as_str()))?;
    contents
        .trim()
        .parse::<u32>()
        .map_err(|e| internal_error(format!("bad value in {}: {}", path, e).as_str()))
}

// Builds the DKMS module from its install tree and inserts it, with the
// settle/reinsert dance the capture driver needs on first insertion.
fn install_kernel_module() -> Result<(), CanonicalError> {
    let mut matches = Vec::new();
    for entry in glob::glob(MODULE_SRC_GLOB)
        .map_err(|e| internal_error(format!("bad module glob: {}", e).as_str()))?
    {
        match entry {
            Ok(path) => matches.push(path),
            Err(e) => warn!("unreadable module source entry: {}", e),
        }
    }
    if matches.len() != 1 {
        return Err(internal_error(
            format!("kernel module install path not found ({} candidates)", matches.len())
                .as_str(),
        ));
    }
    let base = matches[0]
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| internal_error("bad module source path"))?
        .to_string();
    let dkms_module = base.replace('-', "/");
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .map_err(|e| internal_error(format!("cannot read kernel release: {}", e).as_str()))?;
    let build_path = format!(
        "/var/lib/dkms/{}/{}/armv7l/module/{}.ko.xz",
        dkms_module,
        release.trim(),
        MODULE_NAME
    );

    info!("building and installing kernel module {}", dkms_module);
    run_command("dkms", &["build", &dkms_module])?;
    run_command("insmod", &[&build_path])?;
    // First insertion after boot leaves the PRU firmware in a bad state;
    // settle, remove and insert again.
    thread::sleep(Duration::from_secs(5));
    run_command("rmmod", &[MODULE_NAME])?;
    run_command("insmod", &[&build_path])?;
    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> Result<(), CanonicalError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| internal_error(format!("cannot run {}: {}", program, e).as_str()))?;
    if !output.status.success() {
        return Err(internal_error(
            format!(
                "{} failed: {}",
                program,
                String::from_utf8_lossy(&output.stderr)
            )
            .as_str(),
        ));
    }
    Ok(())
}

// Bilinear demosaic of a BGGR mosaic. Missing channels at each site are
// averaged from the in-bounds neighbors carrying them.
pub fn demosaic_bggr(mosaic: &GrayImage) -> RgbImage {
    let (width, height) = mosaic.dimensions();
    let sample = |x: i64, y: i64| -> Option<f64> {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            None
        } else {
            Some(mosaic.get_pixel(x as u32, y as u32).0[0] as f64)
        }
    };
    let average = |coords: &[(i64, i64)]| -> u8 {
        let mut sum = 0.0;
        let mut count = 0;
        for &(x, y) in coords {
            if let Some(v) = sample(x, y) {
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            0
        } else {
            (sum / count as f64).round() as u8
        }
    };

    let mut out = RgbImage::new(width, height);
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let value = mosaic.get_pixel(x as u32, y as u32).0[0];
            let cross = [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)];
            let diagonal = [(x - 1, y - 1), (x + 1, y - 1), (x - 1, y + 1), (x + 1, y + 1)];
            let horizontal = [(x - 1, y), (x + 1, y)];
            let vertical = [(x, y - 1), (x, y + 1)];
            let (r, g, b) = match (y % 2 == 0, x % 2 == 0) {
                // Blue site.
                (true, true) => (average(&diagonal), average(&cross), value),
                // Green site on a blue row.
                (true, false) => (average(&vertical), value, average(&horizontal)),
                // Green site on a red row.
                (false, true) => (average(&horizontal), value, average(&vertical)),
                // Red site.
                (false, false) => (value, average(&cross), average(&diagonal)),
            };
            out.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
        }
    }
    out
}

/// Stand-in detector for ground testing. Follows the same readiness
/// lifecycle as the flight camera but yields zero-filled frames.
pub struct MockCamera {
    state: Arc<CameraStateCell>,
    rows: u32,
    cols: u32,
}

impl MockCamera {
    pub fn new(rows: u32, cols: u32, unlock_delay: Duration) -> Self {
        let state = Arc::new(CameraStateCell::new(CameraState::Lockout));
        if unlock_delay.is_zero() {
            state.set(CameraState::Running);
        } else {
            let cloned_state = state.clone();
            thread::spawn(move || {
                thread::sleep(unlock_delay);
                cloned_state.set(CameraState::Running);
            });
        }
        MockCamera { state, rows, cols }
    }
}

impl AbstractCamera for MockCamera {
    fn capture(&self, color: bool) -> Result<Frame, CanonicalError> {
        let state = self.state.get();
        if state != CameraState::Running {
            return Err(failed_precondition_error(
                format!("camera not ready; state is {:?}", state).as_str(),
            ));
        }
        if color {
            Ok(Frame::Rgb(RgbImage::new(self.cols, self.rows)))
        } else {
            Ok(Frame::Gray(GrayImage::new(self.cols, self.rows)))
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.rows, self.cols)
    }

    fn state(&self) -> CameraState {
        self.state.get()
    }
}

// mod tests.
