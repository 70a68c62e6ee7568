// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;

use canonical_error::{internal_error, not_found_error, unavailable_error, CanonicalError};
use log::debug;

const GOVERNOR_GLOB: &str = "/sys/devices/system/cpu/cpu[0-9]*/cpufreq/scaling_governor";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Governor {
    Performance,
    Powersave,
}

impl Governor {
    fn as_str(&self) -> &'static str {
        match self {
            Governor::Performance => "performance",
            Governor::Powersave => "powersave",
        }
    }
}

/// Switches the frequency governor of every online CPU. Used when entering
/// and leaving the low power status; failures are reported to the caller,
/// which treats them as non-fatal.
pub fn set_governor(governor: Governor) -> Result<(), CanonicalError> {
    let mut written = 0;
    for entry in glob::glob(GOVERNOR_GLOB)
        .map_err(|e| internal_error(format!("bad cpufreq glob: {}", e).as_str()))?
    {
        let path = entry
            .map_err(|e| internal_error(format!("unreadable cpufreq entry: {}", e).as_str()))?;
        fs::write(&path, governor.as_str()).map_err(|e| {
            unavailable_error(
                format!("cannot write {}: {}", path.display(), e).as_str(),
            )
        })?;
        written += 1;
    }
    if written == 0 {
        return Err(not_found_error("no cpufreq governor nodes found"));
    }
    debug!("set {} CPUs to {} governor", written, governor.as_str());
    Ok(())
}
