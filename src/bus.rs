// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use canonical_error::{failed_precondition_error, invalid_argument_error, CanonicalError};
use log::warn;

use crate::camera::{AbstractCamera, Frame};
use crate::cpufreq::{self, Governor};
use crate::filter::FilterThresholds;
use crate::image_sink;
use crate::state::{ServiceStatus, StateMachine};

// Legacy numeric dictionary indices, kept for hosts that address entries by
// index/sub-index instead of by name.
pub const STATUS_INDEX: u16 = 0x6000;
pub const ORIENTATION_INDEX: u16 = 0x6001;
pub const CAPTURE_INDEX: u16 = 0x6002;
pub const CAPTURE_FILTER_INDEX: u16 = 0x6003;
pub const PREVIEW_INDEX: u16 = 0x7000;

/// TPDOs emitted after each successful solve: the orientation angles, then
/// the solve timestamp.
pub const TPDO_ORIENTATION: u16 = 3;
pub const TPDO_TIMESTAMP: u16 = 4;

/// Object dictionary entries exposed to the bus, by name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectKey {
    Status,
    OrientationRightAscension,
    OrientationDeclination,
    OrientationRoll,
    OrientationTimestamp,
    CaptureDelay,
    CaptureDuration,
    CaptureNumImages,
    CaptureSaveCaptures,
    CaptureLastCaptureTime,
    CaptureLastDisplayImage,
    FilterEnable,
    FilterLowerBound,
    FilterUpperBound,
    FilterLowerPercentage,
    FilterUpperPercentage,
}

impl ObjectKey {
    pub fn from_index(index: u16, sub: u8) -> Option<ObjectKey> {
        use ObjectKey::*;
        match (index, sub) {
            (STATUS_INDEX, 0) => Some(Status),
            (ORIENTATION_INDEX, 1) => Some(OrientationRightAscension),
            (ORIENTATION_INDEX, 2) => Some(OrientationDeclination),
            (ORIENTATION_INDEX, 3) => Some(OrientationRoll),
            (ORIENTATION_INDEX, 4) => Some(OrientationTimestamp),
            (CAPTURE_INDEX, 1) => Some(CaptureDelay),
            (CAPTURE_INDEX, 2) => Some(CaptureDuration),
            (CAPTURE_INDEX, 3) => Some(CaptureNumImages),
            (CAPTURE_INDEX, 4) => Some(CaptureSaveCaptures),
            (CAPTURE_INDEX, 5) => Some(CaptureLastCaptureTime),
            (CAPTURE_FILTER_INDEX, 1) => Some(FilterEnable),
            (CAPTURE_FILTER_INDEX, 2) => Some(FilterLowerBound),
            (CAPTURE_FILTER_INDEX, 3) => Some(FilterUpperBound),
            (CAPTURE_FILTER_INDEX, 4) => Some(FilterLowerPercentage),
            (CAPTURE_FILTER_INDEX, 5) => Some(FilterUpperPercentage),
            (PREVIEW_INDEX, 1) => Some(CaptureLastDisplayImage),
            _ => None,
        }
    }

    pub fn index(&self) -> (u16, u8) {
        use ObjectKey::*;
        match self {
            Status => (STATUS_INDEX, 0),
            OrientationRightAscension => (ORIENTATION_INDEX, 1),
            OrientationDeclination => (ORIENTATION_INDEX, 2),
            OrientationRoll => (ORIENTATION_INDEX, 3),
            OrientationTimestamp => (ORIENTATION_INDEX, 4),
            CaptureDelay => (CAPTURE_INDEX, 1),
            CaptureDuration => (CAPTURE_INDEX, 2),
            CaptureNumImages => (CAPTURE_INDEX, 3),
            CaptureSaveCaptures => (CAPTURE_INDEX, 4),
            CaptureLastCaptureTime => (CAPTURE_INDEX, 5),
            FilterEnable => (CAPTURE_FILTER_INDEX, 1),
            FilterLowerBound => (CAPTURE_FILTER_INDEX, 2),
            FilterUpperBound => (CAPTURE_FILTER_INDEX, 3),
            FilterLowerPercentage => (CAPTURE_FILTER_INDEX, 4),
            FilterUpperPercentage => (CAPTURE_FILTER_INDEX, 5),
            CaptureLastDisplayImage => (PREVIEW_INDEX, 1),
        }
    }
}

/// A typed dictionary value crossing the SDO boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectValue {
    U8(u8),
    U32(u32),
    I32(i32),
    Bool(bool),
    Bytes(Vec<u8>),
}

/// Capture-session tunables. Written by bus callbacks, read by the service
/// loop; each handler pass snapshots the fields it needs at entry, so
/// per-field atomics are all the coordination required.
pub struct CaptureSettings {
    pub delay_ms: AtomicU32,
    pub duration_s: AtomicU32,
    /// Zero means unlimited within the duration budget.
    pub max_images: AtomicU32,
    pub save_captures: AtomicBool,
    /// Written by the loop on each accepted capture.
    pub last_capture_time: AtomicU32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            delay_ms: AtomicU32::new(1000),
            duration_s: AtomicU32::new(60),
            max_images: AtomicU32::new(0),
            save_captures: AtomicBool::new(true),
            last_capture_time: AtomicU32::new(0),
        }
    }
}

/// Capture filter tunables; same discipline as `CaptureSettings`.
#[derive(Default)]
pub struct FilterSettings {
    pub enable: AtomicBool,
    pub lower_bound: AtomicU8,
    pub upper_bound: AtomicU8,
    pub lower_percentage: AtomicU8,
    pub upper_percentage: AtomicU8,
}

impl FilterSettings {
    pub fn snapshot(&self) -> FilterThresholds {
        FilterThresholds {
            lower_bound: self.lower_bound.load(Ordering::Relaxed),
            lower_percentage: self.lower_percentage.load(Ordering::Relaxed),
            upper_bound: self.upper_bound.load(Ordering::Relaxed),
            upper_percentage: self.upper_percentage.load(Ordering::Relaxed),
        }
    }
}

/// Last published attitude. All four fields come from the same frame and
/// are updated together under the record's mutex.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrientationRecord {
    pub right_ascension: i32,
    pub declination: i32,
    pub roll: i32,
    /// Spacecraft elapsed time, seconds since UTC midnight.
    pub timestamp: u32,
}

/// The handles handed to the host node runtime. `read` and `write` run on
/// the runtime's threads, arbitrarily interleaved with the service loop;
/// both are short and non-blocking.
pub struct BusSurface {
    machine: Arc<StateMachine>,
    camera: Arc<dyn AbstractCamera>,
    capture: Arc<CaptureSettings>,
    filter: Arc<FilterSettings>,
    orientation: Arc<Mutex<OrientationRecord>>,
    latest_frame: Arc<Mutex<Option<Frame>>>,
    manage_cpufreq: bool,
}

impl BusSurface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: Arc<StateMachine>,
        camera: Arc<dyn AbstractCamera>,
        capture: Arc<CaptureSettings>,
        filter: Arc<FilterSettings>,
        orientation: Arc<Mutex<OrientationRecord>>,
        latest_frame: Arc<Mutex<Option<Frame>>>,
        manage_cpufreq: bool,
    ) -> Self {
        BusSurface {
            machine,
            camera,
            capture,
            filter,
            orientation,
            latest_frame,
            manage_cpufreq,
        }
    }

    pub fn read(&self, key: ObjectKey) -> Result<ObjectValue, CanonicalError> {
        use ObjectKey::*;
        Ok(match key {
            Status => ObjectValue::U8(self.machine.status() as u8),
            OrientationRightAscension => {
                ObjectValue::I32(self.orientation.lock().unwrap().right_ascension)
            }
            OrientationDeclination => {
                ObjectValue::I32(self.orientation.lock().unwrap().declination)
            }
            OrientationRoll => ObjectValue::I32(self.orientation.lock().unwrap().roll),
            OrientationTimestamp => {
                ObjectValue::U32(self.orientation.lock().unwrap().timestamp)
            }
            CaptureDelay => ObjectValue::U32(self.capture.delay_ms.load(Ordering::Relaxed)),
            CaptureDuration => {
                ObjectValue::U32(self.capture.duration_s.load(Ordering::Relaxed))
            }
            CaptureNumImages => {
                ObjectValue::U32(self.capture.max_images.load(Ordering::Relaxed))
            }
            CaptureSaveCaptures => {
                ObjectValue::Bool(self.capture.save_captures.load(Ordering::Relaxed))
            }
            CaptureLastCaptureTime => {
                ObjectValue::U32(self.capture.last_capture_time.load(Ordering::Relaxed))
            }
            CaptureLastDisplayImage => {
                // Produced on demand from the most recent capture; never
                // cached on disk.
                let latest_frame = self.latest_frame.lock().unwrap();
                match &*latest_frame {
                    None => ObjectValue::Bytes(Vec::new()),
                    Some(frame) => {
                        ObjectValue::Bytes(image_sink::encode_preview_jpeg(frame)?)
                    }
                }
            }
            FilterEnable => ObjectValue::Bool(self.filter.enable.load(Ordering::Relaxed)),
            FilterLowerBound => {
                ObjectValue::U8(self.filter.lower_bound.load(Ordering::Relaxed))
            }
            FilterUpperBound => {
                ObjectValue::U8(self.filter.upper_bound.load(Ordering::Relaxed))
            }
            FilterLowerPercentage => {
                ObjectValue::U8(self.filter.lower_percentage.load(Ordering::Relaxed))
            }
            FilterUpperPercentage => {
                ObjectValue::U8(self.filter.upper_percentage.load(Ordering::Relaxed))
            }
        })
    }

    /// Configuration writes take effect on the loop's next handler pass.
    pub fn write(&self, key: ObjectKey, value: ObjectValue) -> Result<(), CanonicalError> {
        use ObjectKey::*;
        match key {
            Status => {
                let ObjectValue::U8(raw) = value else {
                    return Err(invalid_argument_error("status expects a u8"));
                };
                let Some(target) = ServiceStatus::from_u8(raw) else {
                    return Err(invalid_argument_error(
                        format!("not a valid status: {}", raw).as_str(),
                    ));
                };
                let previous = self.machine.request(target, self.camera.state())?;
                if self.manage_cpufreq {
                    if target == ServiceStatus::LowPower && previous != ServiceStatus::LowPower
                    {
                        if let Err(e) = cpufreq::set_governor(Governor::Powersave) {
                            warn!("could not enter powersave governor: {}", e);
                        }
                    } else if previous == ServiceStatus::LowPower
                        && target != ServiceStatus::LowPower
                    {
                        if let Err(e) = cpufreq::set_governor(Governor::Performance) {
                            warn!("could not restore performance governor: {}", e);
                        }
                    }
                }
                Ok(())
            }
            CaptureDelay => {
                let ObjectValue::U32(v) = value else {
                    return Err(invalid_argument_error("capture.delay expects a u32"));
                };
                self.capture.delay_ms.store(v, Ordering::Relaxed);
                Ok(())
            }
            CaptureDuration => {
                let ObjectValue::U32(v) = value else {
                    return Err(invalid_argument_error("capture.duration expects a u32"));
                };
                self.capture.duration_s.store(v, Ordering::Relaxed);
                Ok(())
            }
            CaptureNumImages => {
                let ObjectValue::U32(v) = value else {
                    return Err(invalid_argument_error(
                        "capture.num_of_images expects a u32",
                    ));
                };
                self.capture.max_images.store(v, Ordering::Relaxed);
                Ok(())
            }
            CaptureSaveCaptures => {
                let ObjectValue::Bool(v) = value else {
                    return Err(invalid_argument_error(
                        "capture.save_captures expects a bool",
                    ));
                };
                self.capture.save_captures.store(v, Ordering::Relaxed);
                Ok(())
            }
            FilterEnable => {
                let ObjectValue::Bool(v) = value else {
                    return Err(invalid_argument_error(
                        "capture_filter.enable expects a bool",
                    ));
                };
                self.filter.enable.store(v, Ordering::Relaxed);
                Ok(())
            }
            FilterLowerBound => {
                let ObjectValue::U8(v) = value else {
                    return Err(invalid_argument_error(
                        "capture_filter.lower_bound expects a u8",
                    ));
                };
                self.filter.lower_bound.store(v, Ordering::Relaxed);
                Ok(())
            }
            FilterUpperBound => {
                let ObjectValue::U8(v) = value else {
                    return Err(invalid_argument_error(
                        "capture_filter.upper_bound expects a u8",
                    ));
                };
                self.filter.upper_bound.store(v, Ordering::Relaxed);
                Ok(())
            }
            FilterLowerPercentage => {
                let ObjectValue::U8(v) = value else {
                    return Err(invalid_argument_error(
                        "capture_filter.lower_percentage expects a u8",
                    ));
                };
                // Percent; values past 100 clamp.
                self.filter
                    .lower_percentage
                    .store(v.min(100), Ordering::Relaxed);
                Ok(())
            }
            FilterUpperPercentage => {
                let ObjectValue::U8(v) = value else {
                    return Err(invalid_argument_error(
                        "capture_filter.upper_percentage expects a u8",
                    ));
                };
                self.filter
                    .upper_percentage
                    .store(v.min(100), Ordering::Relaxed);
                Ok(())
            }
            OrientationRightAscension
            | OrientationDeclination
            | OrientationRoll
            | OrientationTimestamp
            | CaptureLastCaptureTime
            | CaptureLastDisplayImage => Err(failed_precondition_error(
                "read-only dictionary entry",
            )),
        }
    }

    /// Orderly-shutdown path: clears the published records and drives the
    /// status to OFF.
    pub fn on_stop(&self) {
        *self.orientation.lock().unwrap() = OrientationRecord::default();
        *self.latest_frame.lock().unwrap() = None;
        self.capture.last_capture_time.store(0, Ordering::Relaxed);
        self.machine.commit(ServiceStatus::Off);
    }
}

// mod tests.
