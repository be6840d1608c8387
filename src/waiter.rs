//! Bounded-retry polling for kernel-created device nodes. The by-path
//! symlinks appear asynchronously after login, so the attach engine polls
//! instead of listening for events.

use std::{path::Path, time::Duration};

use tracing::debug;

use crate::{error::Error, system::System};

/// Wait until `device_path` exists on disk. The first attempt is immediate;
/// `max_retries` of `n` allows up to `n + 1` attempts with `interval_secs`
/// sleeps in between. For non-tcp transports the path contains a PCI
/// wildcard and is resolved through glob; the first match is written back
/// into `device_path`.
pub async fn wait_for_path(
    sys: &dyn System,
    device_path: &mut String,
    max_retries: u32,
    interval_secs: u32,
    transport: &str,
) -> Result<(), Error> {
    if device_path.is_empty() {
        return Err(Error::UnspecifiedDevicePath);
    }

    for attempt in 0..=max_retries {
        if attempt != 0 {
            debug!(
                device.path = %device_path,
                attempt,
                max_retries,
                "device path not present yet, retrying"
            );
            sys.sleep(Duration::from_secs(u64::from(interval_secs))).await;
        }

        match path_exists(sys, device_path, transport) {
            Ok(()) => return Ok(()),
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }
    }

    Err(Error::NotExist {
        path: device_path.clone(),
    })
}

fn path_exists(sys: &dyn System, device_path: &mut String, transport: &str) -> Result<(), Error> {
    if transport == "tcp" {
        sys.stat(Path::new(device_path.as_str()))
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => Error::NotExist {
                    path: device_path.clone(),
                },
                _ => Error::Io { source: error },
            })
    } else {
        let matches = sys.glob(device_path)?;
        match matches.into_iter().next() {
            // Several PCI devices may reach the same target; any one of the
            // matched nodes leads to the same tree, take the first.
            Some(resolved) => {
                *device_path = resolved;
                Ok(())
            }
            None => Err(Error::NotExist {
                path: device_path.clone(),
            }),
        }
    }
}
