// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{not_found_error, unavailable_error, CanonicalError};
use log::{debug, info};

/// Contract the host fieldbus node runtime provides to the payload. The
/// runtime owns the transport and the fread cache; the payload only asks it
/// to emit telemetry records and to take ownership of finished files.
pub trait BusNode: Send + Sync {
    /// Queue the given transmit PDO for emission on the bus.
    fn send_tpdo(&self, tpdo: u16) -> Result<(), CanonicalError>;

    /// Hand a fully written, closed file to the node's fread cache. With
    /// `consume` the cache owns the file's lifetime and unlinks it on
    /// eviction.
    fn fread_cache_add(&self, path: &Path, consume: bool) -> Result<(), CanonicalError>;
}

/// Standalone node runtime for ground testing without a fieldbus stack.
/// TPDO emissions are logged; the fread cache is a plain directory.
pub struct LocalNode {
    cache_dir: PathBuf,
}

impl LocalNode {
    pub fn new(cache_dir: PathBuf) -> Result<Self, CanonicalError> {
        fs::create_dir_all(&cache_dir).map_err(|e| {
            unavailable_error(
                format!("cannot create cache dir {}: {}", cache_dir.display(), e).as_str(),
            )
        })?;
        Ok(LocalNode { cache_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl BusNode for LocalNode {
    fn send_tpdo(&self, tpdo: u16) -> Result<(), CanonicalError> {
        debug!("TPDO {} queued", tpdo);
        Ok(())
    }

    fn fread_cache_add(&self, path: &Path, consume: bool) -> Result<(), CanonicalError> {
        if !path.exists() {
            return Err(not_found_error(
                format!("no such file {}", path.display()).as_str(),
            ));
        }
        info!(
            "fread cache took {} (consume={})",
            path.display(),
            consume
        );
        Ok(())
    }
}

// mod tests.
