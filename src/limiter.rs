//! Per-volume operation serialization. The engines themselves take no locks;
//! callers are expected to keep at most one attach or detach in flight per
//! volume and can use this guard to do so.

use std::{collections::HashSet, sync::Mutex};

use once_cell::sync::OnceCell;
use snafu::Snafu;
use tracing::trace;

/// Errors from taking a volume reservation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum GuardError {
    #[snafu(display("an operation is already in progress for volume: {volume}"))]
    OperationInProgress { volume: String },
}

static INVENTORY: OnceCell<Mutex<HashSet<String>>> = OnceCell::new();

fn inventory() -> &'static Mutex<HashSet<String>> {
    INVENTORY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Reservation keeping at most one operation in flight for a volume name.
/// Dropping the guard releases the reservation.
pub struct VolumeOpGuard {
    volume: String,
}

impl VolumeOpGuard {
    /// Try to reserve the volume for one operation.
    pub fn new(volume: &str) -> Result<Self, GuardError> {
        let mut inventory = inventory().lock().expect("not poisoned");
        if !inventory.insert(volume.to_string()) {
            trace!(volume, "operation already in flight for volume");
            return OperationInProgress { volume }.fail();
        }
        trace!(volume, "volume reserved");
        Ok(Self {
            volume: volume.to_string(),
        })
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        let mut inventory = inventory().lock().expect("not poisoned");
        inventory.remove(self.volume.as_str());
        trace!(volume = %self.volume, "volume released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_operation_per_volume() {
        let guard = VolumeOpGuard::new("limiter-vol-1").unwrap();
        assert!(VolumeOpGuard::new("limiter-vol-1").is_err());
        // other volumes are unaffected
        let other = VolumeOpGuard::new("limiter-vol-2").unwrap();
        drop(other);
        drop(guard);
        // released on drop
        VolumeOpGuard::new("limiter-vol-1").unwrap();
    }
}
