//! Device-mapper multipath operations: flushing and resizing maps, and
//! selecting the shared aggregate under a set of single-path devices.

use std::{path::Path, time::Duration};

use tracing::debug;

use crate::{dev::Device, error::Error, system::System};

const MULTIPATH: &str = "multipath";
const MULTIPATHD: &str = "multipathd";
/// Wall-clock budget for one multipath map flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Flush the device-mapper map of a multipath aggregate. A flush failure is
/// tolerated when the device node is already gone; a map that is still held
/// open is reported as probably-in-use.
pub async fn flush_multipath_device(sys: &dyn System, device: &Device) -> Result<(), Error> {
    let path = device.path();
    debug!(device.path = %path, "flushing multipath device");

    if let Err(error) = sys
        .run(MULTIPATH, &["-f".to_string(), path.clone()], Some(FLUSH_TIMEOUT))
        .await
    {
        match sys.stat(Path::new(&path)) {
            Err(stat_error) if stat_error.kind() == std::io::ErrorKind::NotFound => {
                debug!(device.path = %path, "multipath device already removed");
            }
            _ => {
                let in_use = error.to_string().contains("map in use");
                return Err(Error::MultipathFlush {
                    in_use,
                    source: Box::new(error),
                });
            }
        }
    }

    debug!(device.path = %path, "finished flushing multipath device");
    Ok(())
}

/// Resize a multipath map after its underlying devices have grown.
pub async fn resize_multipath_device(sys: &dyn System, device: &Device) -> Result<(), Error> {
    sys.run(
        MULTIPATHD,
        &[
            "resize".to_string(),
            "map".to_string(),
            device.name.clone(),
        ],
        None,
    )
    .await
    .map(drop)
    .map_err(|error| Error::MultipathResize {
        device: device.name.clone(),
        source: Box::new(error),
    })
}

/// Pick the multipath aggregate shared by all observed single-path devices.
/// Every device must have exactly one child, all children must agree on one
/// name, and that child must be of mpath type.
pub(crate) fn select_multipath(devices: &[Device]) -> Result<Device, Error> {
    let mut multipath: Option<&Device> = None;

    for device in devices {
        if device.children.len() != 1 {
            let hint = if device.children.is_empty() {
                " (is multipathd running?)"
            } else {
                ""
            };
            return Err(Error::MultipathSelection {
                reason: format!(
                    "device {} is not mapped to exactly one multipath device{hint}",
                    device.name
                ),
            });
        }
        let child = &device.children[0];
        if let Some(previous) = multipath {
            if child.name != previous.name {
                return Err(Error::MultipathSelection {
                    reason: format!(
                        "devices do not share a common multipath device: {} != {}",
                        child.name, previous.name
                    ),
                });
            }
        }
        multipath = Some(child);
    }

    let multipath = multipath.ok_or_else(|| Error::MultipathSelection {
        reason: "multipath device not found".to_string(),
    })?;
    if !multipath.is_multipath() {
        return Err(Error::MultipathSelection {
            reason: format!("device {} is not of mpath type", multipath.name),
        });
    }
    Ok(multipath.clone())
}
