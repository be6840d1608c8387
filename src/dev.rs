//! Block-device model and the kernel-facing SCSI plumbing: the lsblk tree,
//! sysfs control-file writes and ordered device removal.

use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::Error, system::System};

const LSBLK: &str = "lsblk";
const LSBLK_COLUMNS: &str = "NAME,KNAME,PKNAME,HCTL,TYPE,TRAN,SIZE";
const SCSI_ID: &str = "scsi_id";
const BLOCKDEV: &str = "blockdev";
/// Wall-clock budget for one scsi_id invocation.
const WWID_TIMEOUT: Duration = Duration::from_secs(1);

/// A block-device node observed in sysfs. Multipath aggregates carry their
/// WWID as `name` and live under `/dev/mapper`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(default)]
    pub hctl: String,
    #[serde(default)]
    pub children: Vec<Device>,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(rename = "tran", default)]
    pub transport: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
}

impl Device {
    /// Filesystem path of the device node.
    pub fn path(&self) -> String {
        if self.is_multipath() {
            format!("/dev/mapper/{}", self.name)
        } else {
            format!("/dev/{}", self.name)
        }
    }

    /// True for device-mapper multipath aggregates.
    pub fn is_multipath(&self) -> bool {
        self.device_type == "mpath"
    }

    /// Check that the device node is present on disk.
    pub fn exists(&self, sys: &dyn System) -> Result<(), Error> {
        let path = self.path();
        sys.stat(Path::new(&path)).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => Error::NotExist { path },
            _ => Error::Io { source: error },
        })
    }

    /// World-wide identifier of the device as reported by scsi_id.
    pub async fn wwid(&self, sys: &dyn System) -> Result<String, Error> {
        let out = sys
            .run(
                SCSI_ID,
                &["-g".to_string(), "-u".to_string(), self.path()],
                Some(WWID_TIMEOUT),
            )
            .await?;
        Ok(out.stdout.trim_end_matches('\n').to_string())
    }

    /// Parse the colon-joined HCTL string of the device.
    pub fn hctl(&self) -> Result<Hctl, Error> {
        Hctl::parse(&self.hctl, &self.name)
    }

    fn write_control(&self, sys: &dyn System, file: &str, content: &str) -> Result<(), Error> {
        let filename = format!("/sys/class/scsi_device/{}/device/{}", self.hctl, file);
        debug!(content = %content.trim_end(), file = %filename, "writing SCSI control file");
        sys.write_file(Path::new(&filename), content)
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => Error::NotExist { path: filename },
                _ => Error::Io { source: error },
            })
    }

    /// Take the SCSI path offline.
    pub fn shutdown(&self, sys: &dyn System) -> Result<(), Error> {
        self.write_control(sys, "state", "offline\n")
    }

    /// Remove the SCSI path from the kernel.
    pub fn delete(&self, sys: &dyn System) -> Result<(), Error> {
        self.write_control(sys, "delete", "1")
    }

    /// Ask the kernel to rescan the SCSI path, picking up size changes.
    pub fn rescan(&self, sys: &dyn System) -> Result<(), Error> {
        self.write_control(sys, "rescan", "1")
    }
}

/// host:channel:target:lun address of a SCSI device in the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hctl {
    pub host: u32,
    pub channel: u32,
    pub target: u32,
    pub lun: u32,
}

impl Hctl {
    fn parse(hctl: &str, device: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidHctl {
            hctl: hctl.to_string(),
            device: device.to_string(),
        };
        let fields: Vec<&str> = hctl.split(':').collect();
        if fields.len() != 4 {
            return Err(invalid());
        }
        let mut values = [0u32; 4];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field.parse().map_err(|_| invalid())?;
        }
        Ok(Self {
            host: values[0],
            channel: values[1],
            target: values[2],
            lun: values[3],
        })
    }
}

/// Run the block lister over `paths` (all devices when empty) and rebuild
/// the device tree from the PKNAME parent pointers; only tree roots are
/// returned. With `strict` false, exit status 64 (some devices not found)
/// yields the partial tree instead of an error.
pub async fn block_devices(
    sys: &dyn System,
    paths: &[String],
    strict: bool,
) -> Result<Vec<Device>, Error> {
    let mut cmd_args: Vec<String> = ["-rn", "-o", LSBLK_COLUMNS]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    cmd_args.extend(paths.iter().cloned());

    let stdout = match sys.run(LSBLK, &cmd_args, None).await {
        Ok(output) => output.stdout,
        Err(error) if !strict && error.is_partial_lsblk() => {
            debug!(%error, "block lister found only some of the requested devices");
            match error {
                Error::ExternalExit { stdout, .. } => stdout,
                _ => String::new(),
            }
        }
        Err(error) => return Err(error),
    };
    parse_block_devices(&stdout)
}

/// Devices reachable from `paths`, restricted to roots on the iSCSI
/// transport.
pub async fn iscsi_devices(
    sys: &dyn System,
    paths: &[String],
    strict: bool,
) -> Result<Vec<Device>, Error> {
    Ok(block_devices(sys, paths, strict)
        .await?
        .into_iter()
        .filter(|device| device.transport == "iscsi")
        .collect())
}

fn parse_block_devices(output: &str) -> Result<Vec<Device>, Error> {
    struct Row {
        device: Device,
        kname: String,
        pkname: String,
    }

    fn assemble(rows: &[Row], index: usize) -> Device {
        let mut device = rows[index].device.clone();
        device.children = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.pkname.is_empty() && row.pkname == rows[index].kname)
            .map(|(child, _)| assemble(rows, child))
            .collect();
        device
    }

    let mut rows = Vec::new();
    for line in output.trim_matches('\n').split('\n') {
        let columns: Vec<&str> = line.split(' ').collect();
        if columns.len() < 5 {
            return Err(Error::InvalidLsblkOutput {
                reason: line.to_string(),
            });
        }
        rows.push(Row {
            device: Device {
                name: columns[0].to_string(),
                hctl: columns[3].to_string(),
                children: Vec::new(),
                device_type: columns[4].to_string(),
                transport: columns.get(5).copied().unwrap_or_default().to_string(),
                size: columns.get(6).copied().unwrap_or_default().to_string(),
            },
            kname: columns[1].to_string(),
            pkname: columns[2].to_string(),
        });
    }

    let known: HashSet<&str> = rows.iter().map(|row| row.kname.as_str()).collect();
    for row in &rows {
        if !row.pkname.is_empty() && !known.contains(row.pkname.as_str()) {
            return Err(Error::InvalidLsblkOutput {
                reason: format!("parent device \"{}\" not found", row.pkname),
            });
        }
    }

    Ok(rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.pkname.is_empty())
        .map(|(index, _)| assemble(&rows, index))
        .collect())
}

/// Remove SCSI devices from the host, in order: flush buffers while the node
/// is still present, take the path offline, then delete it through sysfs.
/// Control files that are already gone are tolerated; the first other error
/// is returned once every device has been attempted.
pub async fn remove_scsi_devices(sys: &dyn System, devices: &[Device]) -> Result<(), Error> {
    let mut first_error = None;

    for device in devices {
        match device.exists(sys) {
            Ok(()) => {
                debug!(device.name = %device.name, "flushing buffers");
                if let Err(error) = sys
                    .run(
                        BLOCKDEV,
                        &["--flushbufs".to_string(), device.path()],
                        None,
                    )
                    .await
                {
                    debug!(device.path = %device.path(), %error, "failed to flush the device");
                    return Err(error);
                }
            }
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }

        debug!(device.name = %device.name, "taking SCSI device offline");
        if let Err(error) = device.shutdown(sys) {
            if !error.is_not_found() {
                first_error.get_or_insert(error);
                continue;
            }
        }

        debug!(device.name = %device.name, "deleting SCSI device");
        if let Err(error) = device.delete(sys) {
            if !error.is_not_found() {
                first_error.get_or_insert(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
