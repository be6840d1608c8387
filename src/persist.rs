//! Node-local persistence of connection records, so a detach can proceed
//! without the caller-supplied inputs that produced the attach.

use std::path::Path;

use snafu::ResultExt;
use tracing::debug;

use crate::{
    connector::Connector,
    dev::block_devices,
    error::{Error, Load, LoadDecode, Persist, PersistEncode},
    system::System,
};

/// Serialize the connector to `path`, overwriting any previous record.
pub async fn persist(connector: &Connector, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    debug!(volume.name = %connector.volume_name, path = %path.display(), "persisting connector");
    let record = serde_json::to_vec(connector).context(PersistEncode)?;
    tokio::fs::write(path, record).await.context(Persist {
        path: path.display().to_string(),
    })
}

/// Load a connector record and re-resolve `mount_target_device` and
/// `devices` against the current state of the node (non-strict, devices may
/// have changed since the record was written). Fails when the record has no
/// mount target.
pub async fn load(sys: &dyn System, path: impl AsRef<Path>) -> Result<Connector, Error> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path).await.context(Load {
        path: path.display().to_string(),
    })?;
    let mut connector: Connector = serde_json::from_str(&data).context(LoadDecode {
        path: path.display().to_string(),
    })?;

    let device_paths: Vec<String> = connector
        .devices
        .iter()
        .map(|device| device.path())
        .collect();
    let mount_target = connector
        .mount_target_device
        .take()
        .ok_or_else(|| Error::MissingTarget {
            what: "mount target device in persisted record".to_string(),
        })?;

    let mount_path = mount_target.path();
    let resolved = block_devices(sys, std::slice::from_ref(&mount_path), false).await?;
    connector.mount_target_device = Some(resolved.into_iter().next().ok_or(Error::NotExist {
        path: mount_path,
    })?);
    connector.devices = block_devices(sys, &device_paths, false).await?;

    Ok(connector)
}
