// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Mutex;

use canonical_error::{failed_precondition_error, invalid_argument_error, CanonicalError};
use log::{info, warn};

use crate::camera::CameraState;

/// Service status, with the wire encoding used on the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceStatus {
    Off = 0,
    Boot = 1,
    Standby = 2,
    LowPower = 3,
    StarTrack = 4,
    CaptureOnly = 5,
    Error = 0xFF,
}

impl ServiceStatus {
    pub fn from_u8(value: u8) -> Option<ServiceStatus> {
        match value {
            0 => Some(ServiceStatus::Off),
            1 => Some(ServiceStatus::Boot),
            2 => Some(ServiceStatus::Standby),
            3 => Some(ServiceStatus::LowPower),
            4 => Some(ServiceStatus::StarTrack),
            5 => Some(ServiceStatus::CaptureOnly),
            0xFF => Some(ServiceStatus::Error),
            _ => None,
        }
    }
}

/// Statuses reachable from `from` by external command. BOOT is exited only
/// by the service loop's settle timer, and ERROR only towards OFF.
pub fn commandable_transitions(from: ServiceStatus) -> &'static [ServiceStatus] {
    use ServiceStatus::*;
    match from {
        Off => &[Boot],
        Boot => &[],
        Standby => &[LowPower, StarTrack, CaptureOnly],
        LowPower => &[Standby, StarTrack, CaptureOnly],
        StarTrack => &[Standby, LowPower, CaptureOnly, Error],
        CaptureOnly => &[Standby, LowPower, StarTrack, Error],
        Error => &[Off],
    }
}

/// Sole owner of the service status. External commands go through
/// `request()`, which enforces the transition table with camera-readiness
/// context; the service loop's own transitions go through `commit()`.
/// Both paths hold the status lock for a handful of comparisons only.
pub struct StateMachine {
    status: Mutex<ServiceStatus>,
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            status: Mutex::new(ServiceStatus::Boot),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.lock().unwrap()
    }

    /// Loop-internal transition: settle-timer exit from BOOT, handler exits
    /// to STANDBY, fault escalation to ERROR.
    pub fn commit(&self, target: ServiceStatus) {
        let mut status = self.status.lock().unwrap();
        if *status != target {
            info!("changing status: {:?} -> {:?}", *status, target);
            *status = target;
        }
    }

    /// Externally commanded transition. Returns the previous status on
    /// success. A command equal to the current status is a no-op success.
    pub fn request(
        &self,
        target: ServiceStatus,
        camera: CameraState,
    ) -> Result<ServiceStatus, CanonicalError> {
        let mut status = self.status.lock().unwrap();
        let from = *status;

        if camera == CameraState::Error && from != ServiceStatus::Error {
            warn!("camera fault at command time; forcing ERROR");
            *status = ServiceStatus::Error;
            return Err(failed_precondition_error(
                "camera fault; status forced to ERROR",
            ));
        }
        if target == from {
            return Ok(from);
        }
        if from == ServiceStatus::Boot {
            return Err(failed_precondition_error(
                "BOOT is exited by the settle timer, not by command",
            ));
        }
        if !commandable_transitions(from).contains(&target) {
            info!("invalid status change: {:?} -> {:?}", from, target);
            return Err(invalid_argument_error(
                format!("no transition {:?} -> {:?}", from, target).as_str(),
            ));
        }
        if camera == CameraState::Lockout
            && matches!(
                target,
                ServiceStatus::StarTrack | ServiceStatus::CaptureOnly
            )
        {
            return Err(failed_precondition_error(
                "camera is still in its boot lockout",
            ));
        }

        info!("changing status: {:?} -> {:?}", from, target);
        *status = target;
        Ok(from)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}

// mod tests.
