//! iSCSI block-device attachment engine for node agents.
//!
//! Given a description of a remote iSCSI target (portal list, IQN, LUN,
//! optional CHAP credentials, optional multipath), the engine drives the
//! node's initiator utility and the kernel SCSI subsystem to bring a block
//! device online, validates that the resulting multipath topology is
//! consistent, persists the connection record for later teardown, and tears
//! the device down safely on detach.
//!
//! Attaching a volume:
//! ```ignore
//!     let sys = HostSystem;
//!     let mut connector = Connector {
//!         volume_name: volume_id.to_string(),
//!         target_iqn: iqn,
//!         target_portals: portals,
//!         lun,
//!         ..Connector::default()
//!     };
//!     let device_path = connector.connect(&sys).await?;
//!     persist::persist(&connector, &record_path).await?;
//! ```
//!
//! Detaching reverses this from the persisted record:
//! ```ignore
//!     let connector = persist::load(&sys, &record_path).await?;
//!     connector.disconnect_volume(&sys).await?;
//! ```

/// The connection descriptor and the attach/detach engines.
pub mod connector;
/// Block-device model and SCSI plumbing.
pub mod dev;
/// Error taxonomy.
pub mod error;
/// The initiator utility wrapper.
pub mod iscsiadm;
/// Per-volume operation guard for callers.
pub mod limiter;
/// Device-mapper multipath operations.
pub mod multipath;
/// Connection-record persistence.
pub mod persist;
/// Host capability set and its production implementation.
pub mod system;
/// Device-node polling.
pub mod waiter;

pub use connector::{disconnect, Connector};
pub use dev::{block_devices, iscsi_devices, remove_scsi_devices, Device, Hctl};
pub use error::{Error, InitiatorStage};
pub use iscsiadm::{IscsiAdm, IscsiSession, Secrets};
pub use limiter::VolumeOpGuard;
pub use multipath::{flush_multipath_device, resize_multipath_device};
pub use persist::{load, persist};
pub use system::{CommandOutput, HostSystem, System};
pub use waiter::wait_for_path;
