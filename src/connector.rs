//! The connection descriptor and the attach/detach engines built on it.
//!
//! A `Connector` says *what* to connect: portals, IQN, LUN, credentials and
//! polling budget. `connect` drives the initiator and the kernel until a
//! mountable block device exists, fills in the observed devices and returns
//! the path to mount; `disconnect_volume` tears the device down again using
//! the same record.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    dev::{iscsi_devices, remove_scsi_devices, Device},
    error::Error,
    iscsiadm::{extract_transport, IscsiAdm, Secrets},
    multipath::{flush_multipath_device, resize_multipath_device, select_multipath},
    system::System,
    waiter::wait_for_path,
};

const DEFAULT_PORT: &str = "3260";
const DEFAULT_RETRY_COUNT: u32 = 10;
const DEFAULT_CHECK_INTERVAL: u32 = 1;
const DEFAULT_IFACE: &str = "default";

/// Everything needed to attach one volume to this node. The caller fills in
/// the target description; `connect` fills in `mount_target_device` and
/// `devices` on success.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    pub volume_name: String,
    pub target_iqn: String,
    pub target_portals: Vec<String>,
    pub lun: i32,
    #[serde(default)]
    pub auth_type: String,
    #[serde(default)]
    pub discovery_secrets: Secrets,
    #[serde(default)]
    pub session_secrets: Secrets,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub mount_target_device: Option<Device>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub check_interval: u32,
    #[serde(default)]
    pub do_discovery: bool,
    #[serde(default)]
    pub do_chap_discovery: bool,
}

/// Split a portal into host and port, defaulting the port to 3260.
pub(crate) fn split_portal(portal: &str) -> Result<(&str, &str), Error> {
    let (host, port) = match portal.split_once(':') {
        Some((host, port)) => (host, port),
        None => (portal, DEFAULT_PORT),
    };
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(Error::InvalidPortal {
            portal: portal.to_string(),
        });
    }
    Ok((host, port))
}

fn device_path_for(transport: &str, portal: &str, iqn: &str, lun: i32) -> String {
    if transport == "tcp" {
        format!("/dev/disk/by-path/ip-{portal}-iscsi-{iqn}-lun-{lun}")
    } else {
        format!("/dev/disk/by-path/pci-*-ip-{portal}-iscsi-{iqn}-lun-{lun}")
    }
}

impl Connector {
    /// Attach the described volume to this node and return the path the
    /// caller should mount.
    pub async fn connect(&mut self, sys: &dyn System) -> Result<String, Error> {
        if self.target_iqn.is_empty() {
            return Err(Error::MissingTarget {
                what: "target IQN".to_string(),
            });
        }
        if self.target_portals.is_empty() {
            return Err(Error::MissingTarget {
                what: "target portals".to_string(),
            });
        }
        if self.retry_count == 0 {
            self.retry_count = DEFAULT_RETRY_COUNT;
        }
        if self.check_interval == 0 {
            self.check_interval = DEFAULT_CHECK_INTERVAL;
        }

        let iface = if self.interface.is_empty() {
            DEFAULT_IFACE.to_string()
        } else {
            self.interface.clone()
        };
        let adm = IscsiAdm::new(sys);
        let record = adm.show_interface(&iface).await?;
        let transport = extract_transport(&record);

        let mut last_error = None;
        let mut device_paths = Vec::new();
        for portal in self.target_portals.clone() {
            match self.connect_target(sys, &iface, &transport, &portal).await {
                Ok(path) => {
                    debug!(device.path = %path, "portal produced a device path");
                    device_paths.push(path);
                }
                Err(error) => {
                    warn!(%portal, %error, "failed to connect target portal");
                    last_error = Some(error);
                }
            }
        }

        self.devices = if device_paths.is_empty() {
            Vec::new()
        } else {
            iscsi_devices(sys, &device_paths, true).await?
        };

        if self.devices.is_empty() {
            let _ = adm.delete_iface(&iface).await;
            return Err(Error::ConnectFailed {
                paths: device_paths,
                last_error: last_error
                    .map(|error| error.to_string())
                    .unwrap_or_default(),
            });
        }

        let mount_target = match self.select_mount_target() {
            Ok(device) => device,
            Err(error) => return Err(self.roll_back(sys, error).await),
        };
        let mount_path = mount_target.path();
        self.mount_target_device = Some(mount_target);

        if self.is_multipath_enabled() {
            if let Err(error) = self.check_multipath_consistency(sys).await {
                return Err(self.roll_back(sys, error).await);
            }
        }

        Ok(mount_path)
    }

    async fn connect_target(
        &self,
        sys: &dyn System,
        iface: &str,
        transport: &str,
        portal: &str,
    ) -> Result<String, Error> {
        debug!(target.iqn = %self.target_iqn, %portal, "connecting target portal");
        let adm = IscsiAdm::new(sys);
        let (host, port) = split_portal(portal)?;

        // Rescan the session to discover newly mapped LUNs; a daemon that no
        // longer answers is handled by logging out of this portal.
        if let Err(error) = adm.rescan_node(&self.target_iqn, host).await {
            debug!(%error, "failed to rescan session");
            if error.is_timeout() {
                warn!(%portal, "initiator rescan timed out, logging out");
                adm.logout_unbounded(&self.target_iqn, host).await?;
            }
        }

        let portal = format!("{host}:{port}");
        let mut device_path = device_path_for(transport, &portal, &self.target_iqn, self.lun);

        if adm
            .session_exists(&portal, &self.target_iqn)
            .await
            .unwrap_or(false)
        {
            debug!(device.path = %device_path, "session already exists, waiting for device path");
            wait_for_path(
                sys,
                &mut device_path,
                self.retry_count,
                self.check_interval,
                transport,
            )
            .await?;
            return Ok(device_path);
        }

        self.discover_target(sys, iface, &portal).await?;
        adm.login(&self.target_iqn, &portal).await?;

        debug!(device.path = %device_path, "waiting for device path");
        wait_for_path(
            sys,
            &mut device_path,
            self.retry_count,
            self.check_interval,
            transport,
        )
        .await?;
        Ok(device_path)
    }

    async fn discover_target(
        &self,
        sys: &dyn System,
        iface: &str,
        portal: &str,
    ) -> Result<(), Error> {
        let adm = IscsiAdm::new(sys);
        if self.do_discovery {
            adm.discoverydb(portal, iface, &self.discovery_secrets, self.do_chap_discovery)
                .await?;
        }
        if self.do_chap_discovery {
            adm.create_db_entry(
                &self.target_iqn,
                portal,
                iface,
                &self.discovery_secrets,
                &self.session_secrets,
            )
            .await?;
        }
        Ok(())
    }

    /// Remove the devices observed by a failed attach and clear the output
    /// fields, so no device is left online behind an error.
    async fn roll_back(&mut self, sys: &dyn System, error: Error) -> Error {
        debug!(%error, "connect failed, removing observed devices");
        let removal = remove_scsi_devices(sys, &self.devices).await;
        self.mount_target_device = None;
        self.devices = Vec::new();
        match removal {
            Ok(()) => error,
            Err(removal_error) => removal_error,
        }
    }

    fn select_mount_target(&self) -> Result<Device, Error> {
        if self.devices.len() > 1 {
            return select_multipath(&self.devices);
        }
        self.devices
            .first()
            .cloned()
            .ok_or_else(|| Error::MissingTarget {
                what: "connector does not contain any device".to_string(),
            })
    }

    /// True when the mount target is a device-mapper multipath aggregate.
    pub fn is_multipath_enabled(&self) -> bool {
        self.mount_target_device
            .as_ref()
            .is_some_and(Device::is_multipath)
    }

    /// Remove the attached volume from the node. The filesystem on it must
    /// already be unmounted.
    pub async fn disconnect_volume(&self, sys: &dyn System) -> Result<(), Error> {
        let mount_target =
            self.mount_target_device
                .as_ref()
                .ok_or_else(|| Error::MissingTarget {
                    what: "mount target device".to_string(),
                })?;

        if self.is_multipath_enabled() {
            self.check_multipath_consistency(sys).await?;
            debug!(device.path = %mount_target.path(), "removing multipath device");
            flush_multipath_device(sys, mount_target).await?;
            remove_scsi_devices(sys, &self.devices).await?;
        } else {
            debug!(device.path = %mount_target.path(), "removing single-path device");
            remove_scsi_devices(sys, std::slice::from_ref(mount_target)).await?;
        }

        debug!("finished disconnecting volume");
        Ok(())
    }

    /// Tear down the sessions for this target: one logout per distinct
    /// portal host and exactly one DB delete for the IQN.
    pub async fn disconnect(&self, sys: &dyn System) -> Result<(), Error> {
        disconnect(sys, &self.target_iqn, &self.target_portals).await
    }

    /// Pick up a capacity change after the target has grown the LUN: rescan
    /// every underlying SCSI path and resize the multipath map on top of
    /// them.
    pub async fn resize_volume(&self, sys: &dyn System) -> Result<(), Error> {
        let mount_target =
            self.mount_target_device
                .as_ref()
                .ok_or_else(|| Error::MissingTarget {
                    what: "mount target device".to_string(),
                })?;

        if self.is_multipath_enabled() {
            for device in &self.devices {
                debug!(device.name = %device.name, "rescanning SCSI path");
                device.rescan(sys)?;
            }
            resize_multipath_device(sys, mount_target).await
        } else {
            debug!(device.name = %mount_target.name, "rescanning SCSI path");
            mount_target.rescan(sys)
        }
    }

    /// Cross-check sizes, LUNs, HBA uniqueness and WWIDs across all paths of
    /// the multipath aggregate.
    pub async fn check_multipath_consistency(&self, sys: &dyn System) -> Result<(), Error> {
        let mount_target =
            self.mount_target_device
                .as_ref()
                .ok_or_else(|| Error::MissingTarget {
                    what: "mount target device".to_string(),
                })?;

        let mut devices = vec![mount_target.clone()];
        devices.extend(self.devices.iter().cloned());
        let reference = &devices[0];

        let mut reference_lun: Option<(u32, String)> = None;
        let mut controllers: HashMap<u32, String> = HashMap::new();

        for device in &devices {
            if device.size != reference.size {
                return Err(inconsistent(format!(
                    "devices size differ: {} ({}) != {} ({})",
                    device.name, device.size, reference.name, reference.size
                )));
            }

            if !device.is_multipath() {
                let hctl = device
                    .hctl()
                    .map_err(|error| inconsistent(error.to_string()))?;

                match &reference_lun {
                    None => reference_lun = Some((hctl.lun, device.name.clone())),
                    Some((lun, name)) if hctl.lun != *lun => {
                        return Err(inconsistent(format!(
                            "devices LUNs differ: {} ({}) != {} ({})",
                            device.name, hctl.lun, name, lun
                        )));
                    }
                    Some(_) => {}
                }

                if let Some(previous) = controllers.insert(hctl.host, device.name.clone()) {
                    return Err(inconsistent(format!(
                        "two devices are using the same controller ({}): {} and {}",
                        hctl.host, device.name, previous
                    )));
                }
            }

            let wwid = match device.wwid(sys).await {
                Ok(wwid) => wwid,
                Err(error) => {
                    return Err(inconsistent(format!(
                        "could not find WWID for device {}: {}",
                        device.name, error
                    )));
                }
            };
            if wwid != reference.name {
                return Err(inconsistent(format!(
                    "devices WWIDs differ: {} (wwid:{}) != {} (wwid:{})",
                    device.name, wwid, reference.name, reference.name
                )));
            }
        }

        Ok(())
    }
}

fn inconsistent(reason: String) -> Error {
    Error::MultipathInconsistent { reason }
}

/// Tear down the sessions for a target without a full connector: one logout
/// per distinct portal host, then exactly one node DB delete for the IQN.
pub async fn disconnect(sys: &dyn System, iqn: &str, portals: &[String]) -> Result<(), Error> {
    let adm = IscsiAdm::new(sys);
    let mut seen = HashSet::new();
    for portal in portals {
        let (host, _) = split_portal(portal)?;
        if seen.insert(host.to_string()) {
            adm.logout(iqn, host).await?;
        }
    }
    adm.delete_db_entry(iqn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::{exit, out, FakeSystem};
    use crate::system::CommandOutput;

    const IQN: &str = "iqn.2010-10.org.openstack:volume-eb393993-73d0-4e39-9ef4-b5841e244ced";
    const WWID: &str = "3600c0ff0000000000000000000000000";
    const IFACE_RECORD: &str = "iface.iscsi_ifacename = default\niface.transport_name = tcp\n";

    fn disk(name: &str, hctl: &str, size: &str) -> Device {
        Device {
            name: name.to_string(),
            hctl: hctl.to_string(),
            device_type: "disk".to_string(),
            transport: "iscsi".to_string(),
            size: size.to_string(),
            ..Device::default()
        }
    }

    fn mpath(name: &str, size: &str) -> Device {
        Device {
            name: name.to_string(),
            hctl: "0:0:0:1".to_string(),
            device_type: "mpath".to_string(),
            size: size.to_string(),
            ..Device::default()
        }
    }

    #[test]
    fn portal_normalization() {
        assert_eq!(split_portal("10.0.0.1").unwrap(), ("10.0.0.1", "3260"));
        assert_eq!(split_portal("10.0.0.1:860").unwrap(), ("10.0.0.1", "860"));
        assert!(split_portal(":3260").is_err());
        assert!(split_portal("10.0.0.1:port").is_err());
    }

    fn scripted_exec(
        session_output: &'static str,
        lsblk_output: &'static str,
    ) -> impl Fn(&str, &[String]) -> Result<CommandOutput, Error> + Send + Sync + 'static {
        move |command, cmd_args| match command {
            "iscsiadm" if cmd_args.windows(2).any(|w| w == ["-o", "show"]) => out(IFACE_RECORD),
            "iscsiadm" if cmd_args == ["-m", "session"] => {
                if session_output.is_empty() {
                    exit("iscsiadm", 21, "No active sessions.\n")
                } else {
                    out(session_output)
                }
            }
            "iscsiadm" => out(""),
            "lsblk" => out(lsblk_output),
            "scsi_id" => out(&format!("{WWID}\n")),
            other => exit(other, 1, "unexpected command"),
        }
    }

    #[tokio::test]
    async fn single_path_tcp_attach() {
        let sys = FakeSystem::with_exec(scripted_exec(
            "",
            "sdb sdb  3:0:0:0 disk iscsi 10G\n",
        ))
        .with_path(&format!(
            "/dev/disk/by-path/ip-192.168.1.107:3260-iscsi-{IQN}-lun-0"
        ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["192.168.1.107".to_string()],
            lun: 0,
            ..Connector::default()
        };

        let path = connector.connect(&sys).await.unwrap();
        assert_eq!(path, "/dev/sdb");
        assert_eq!(connector.devices.len(), 1);
        assert_eq!(connector.devices[0].name, "sdb");
        assert_eq!(connector.devices[0].transport, "iscsi");
        assert_eq!(
            connector.mount_target_device.as_ref(),
            Some(&connector.devices[0])
        );
        // no session existed, so a login was issued against the normalized portal
        assert!(sys.commands().iter().any(|command| command
            == &format!("iscsiadm -m node -T {IQN} -p 192.168.1.107:3260 -l")));
        // defaults were applied
        assert_eq!(connector.retry_count, 10);
        assert_eq!(connector.check_interval, 1);
    }

    const MULTIPATH_LSBLK: &str = "sda sda  1:0:0:1 disk iscsi 10G\n\
         3600c0ff0000000000000000000000000 dm-0 sda  mpath  10G\n\
         sdb sdb  2:0:0:1 disk iscsi 10G\n\
         3600c0ff0000000000000000000000000 dm-0 sdb  mpath  10G\n";

    const MULTIPATH_SESSIONS: &str = "tcp: [1] 10.0.0.1:3260,1 iqn.2010-10.org.openstack:volume-eb393993-73d0-4e39-9ef4-b5841e244ced (non-flash)\n\
         tcp: [2] 10.0.0.2:3260,1 iqn.2010-10.org.openstack:volume-eb393993-73d0-4e39-9ef4-b5841e244ced (non-flash)\n";

    #[tokio::test]
    async fn two_portal_multipath_attach() {
        let sys = FakeSystem::with_exec(scripted_exec(MULTIPATH_SESSIONS, MULTIPATH_LSBLK))
            .with_path(&format!(
                "/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-{IQN}-lun-1"
            ))
            .with_path(&format!(
                "/dev/disk/by-path/ip-10.0.0.2:3260-iscsi-{IQN}-lun-1"
            ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            lun: 1,
            ..Connector::default()
        };

        let path = connector.connect(&sys).await.unwrap();
        assert_eq!(path, format!("/dev/mapper/{WWID}"));
        assert_eq!(connector.devices.len(), 2);
        assert!(connector.is_multipath_enabled());
        // sessions existed, so no login was issued
        assert!(!sys.commands().iter().any(|command| command.ends_with(" -l")));
    }

    #[tokio::test]
    async fn multipath_lun_mismatch_rolls_back() {
        const MISMATCHED_LSBLK: &str = "sda sda  1:0:0:1 disk iscsi 10G\n\
             3600c0ff0000000000000000000000000 dm-0 sda  mpath  10G\n\
             sdb sdb  2:0:0:3 disk iscsi 10G\n\
             3600c0ff0000000000000000000000000 dm-0 sdb  mpath  10G\n";

        let sys = FakeSystem::with_exec(scripted_exec(MULTIPATH_SESSIONS, MISMATCHED_LSBLK))
            .with_path(&format!(
                "/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-{IQN}-lun-1"
            ))
            .with_path(&format!(
                "/dev/disk/by-path/ip-10.0.0.2:3260-iscsi-{IQN}-lun-1"
            ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            lun: 1,
            ..Connector::default()
        };

        let error = connector.connect(&sys).await.unwrap_err();
        assert!(error.to_string().contains("LUNs differ"));
        // rollback removed the observed devices through sysfs
        assert_eq!(
            sys.written("scsi_device/1:0:0:1/device/state").as_deref(),
            Some("offline\n")
        );
        assert_eq!(
            sys.written("scsi_device/1:0:0:1/device/delete").as_deref(),
            Some("1")
        );
        assert_eq!(
            sys.written("scsi_device/2:0:0:3/device/state").as_deref(),
            Some("offline\n")
        );
        // and cleared the connector outputs
        assert!(connector.mount_target_device.is_none());
        assert!(connector.devices.is_empty());
    }

    #[tokio::test]
    async fn rescan_timeout_triggers_logout() {
        let sys = FakeSystem::with_exec(move |command, cmd_args| match command {
            "iscsiadm" if cmd_args.windows(2).any(|w| w == ["-o", "show"]) => out(IFACE_RECORD),
            "iscsiadm" if cmd_args.last().is_some_and(|arg| arg == "-R") => {
                Err(Error::Timeout {
                    command: "iscsiadm".to_string(),
                })
            }
            "iscsiadm" if cmd_args == ["-m", "session"] => out(
                "tcp: [1] 192.168.1.107:3260,1 iqn.2010-10.org.openstack:volume-eb393993-73d0-4e39-9ef4-b5841e244ced (non-flash)\n",
            ),
            "iscsiadm" => out(""),
            "lsblk" => out("sdb sdb  3:0:0:0 disk iscsi 10G\n"),
            other => exit(other, 1, "unexpected command"),
        })
        .with_path(&format!(
            "/dev/disk/by-path/ip-192.168.1.107:3260-iscsi-{IQN}-lun-0"
        ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["192.168.1.107".to_string()],
            ..Connector::default()
        };

        connector.connect(&sys).await.unwrap();
        let commands = sys.commands();
        let logout = commands
            .iter()
            .position(|command| command.ends_with(" -u"))
            .expect("logout was issued after the rescan timeout");
        let session_check = commands
            .iter()
            .position(|command| command == "iscsiadm -m session")
            .expect("session listing");
        assert!(logout < session_check);
    }

    #[tokio::test]
    async fn attach_without_devices_deletes_iface_and_reports_last_error() {
        // no session, login fine, but the device path never appears
        let sys = FakeSystem::with_exec(scripted_exec("", ""));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["192.168.1.107".to_string()],
            retry_count: 1,
            check_interval: 1,
            ..Connector::default()
        };

        let error = connector.connect(&sys).await.unwrap_err();
        assert!(error.to_string().contains("failed to find device path"));
        assert!(sys
            .commands()
            .iter()
            .any(|command| command == "iscsiadm -m iface -I default -o delete"));
        assert!(connector.devices.is_empty());
        assert!(connector.mount_target_device.is_none());
    }

    #[tokio::test]
    async fn one_failing_portal_does_not_short_circuit_the_others() {
        // the first portal times out on login, the second already has a session
        let sys = FakeSystem::with_exec(move |command, cmd_args| match command {
            "iscsiadm" if cmd_args.windows(2).any(|w| w == ["-o", "show"]) => out(IFACE_RECORD),
            "iscsiadm" if cmd_args == ["-m", "session"] => out(
                "tcp: [2] 10.0.0.2:3260,1 iqn.2010-10.org.openstack:volume-eb393993-73d0-4e39-9ef4-b5841e244ced (non-flash)\n",
            ),
            "iscsiadm"
                if cmd_args.last().is_some_and(|arg| arg == "-l")
                    && cmd_args.iter().any(|arg| arg == "10.0.0.1:3260") =>
            {
                Err(Error::Timeout {
                    command: "iscsiadm".to_string(),
                })
            }
            "iscsiadm" => out(""),
            "lsblk" => out("sdb sdb  3:0:0:1 disk iscsi 10G\n"),
            other => exit(other, 1, "unexpected command"),
        })
        .with_path(&format!(
            "/dev/disk/by-path/ip-10.0.0.2:3260-iscsi-{IQN}-lun-1"
        ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            lun: 1,
            ..Connector::default()
        };

        let path = connector.connect(&sys).await.unwrap();
        assert_eq!(path, "/dev/sdb");
        assert_eq!(connector.devices.len(), 1);
    }

    #[tokio::test]
    async fn multipath_selection_failure_rolls_back() {
        // two paths materialized but multipathd mapped neither
        const FLAT_LSBLK: &str =
            "sda sda  1:0:0:1 disk iscsi 10G\nsdb sdb  2:0:0:1 disk iscsi 10G\n";

        let sys = FakeSystem::with_exec(scripted_exec(MULTIPATH_SESSIONS, FLAT_LSBLK))
            .with_path(&format!(
                "/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-{IQN}-lun-1"
            ))
            .with_path(&format!(
                "/dev/disk/by-path/ip-10.0.0.2:3260-iscsi-{IQN}-lun-1"
            ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            lun: 1,
            ..Connector::default()
        };

        let error = connector.connect(&sys).await.unwrap_err();
        assert!(error.to_string().contains("is multipathd running?"));
        assert_eq!(
            sys.written("scsi_device/1:0:0:1/device/state").as_deref(),
            Some("offline\n")
        );
        assert_eq!(
            sys.written("scsi_device/2:0:0:1/device/delete").as_deref(),
            Some("1")
        );
        assert!(connector.mount_target_device.is_none());
        assert!(connector.devices.is_empty());
    }

    #[tokio::test]
    async fn missing_target_information_is_rejected() {
        let sys = FakeSystem::new();
        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_portals: vec!["10.0.0.1".to_string()],
            ..Connector::default()
        };
        assert!(matches!(
            connector.connect(&sys).await.unwrap_err(),
            Error::MissingTarget { .. }
        ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            ..Connector::default()
        };
        assert!(matches!(
            connector.connect(&sys).await.unwrap_err(),
            Error::MissingTarget { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_normal_volume_removes_the_mount_target_only() {
        let sys = FakeSystem::new();
        let device = disk("sdb", "1:0:0:0", "");
        let connector = Connector {
            devices: vec![device.clone()],
            mount_target_device: Some(device),
            ..Connector::default()
        };
        connector.disconnect_volume(&sys).await.unwrap();
        assert_eq!(
            sys.written("scsi_device/1:0:0:0/device/state").as_deref(),
            Some("offline\n")
        );
        assert_eq!(
            sys.written("scsi_device/1:0:0:0/device/delete").as_deref(),
            Some("1")
        );
    }

    fn multipath_connector() -> Connector {
        Connector {
            devices: vec![disk("sda", "0:0:0:0", ""), disk("sdb", "1:0:0:0", "")],
            mount_target_device: Some(mpath(WWID, "")),
            ..Connector::default()
        }
    }

    #[tokio::test]
    async fn disconnect_multipath_volume() {
        let sys = FakeSystem::with_exec(|command, _| match command {
            "scsi_id" => out(&format!("{WWID}\n")),
            _ => out(""),
        });
        multipath_connector().disconnect_volume(&sys).await.unwrap();
        assert!(sys
            .commands()
            .iter()
            .any(|command| command == &format!("multipath -f /dev/mapper/{WWID}")));
        assert_eq!(
            sys.written("scsi_device/0:0:0:0/device/delete").as_deref(),
            Some("1")
        );
        assert_eq!(
            sys.written("scsi_device/1:0:0:0/device/state").as_deref(),
            Some("offline\n")
        );
    }

    #[tokio::test]
    async fn disconnect_multipath_flush_timeout_stops_the_teardown() {
        let sys = FakeSystem::with_exec(|command, _| match command {
            "scsi_id" => out(&format!("{WWID}\n")),
            "multipath" => Err(Error::Timeout {
                command: "multipath".to_string(),
            }),
            _ => out(""),
        })
        .with_path(&format!("/dev/mapper/{WWID}"));

        let error = multipath_connector()
            .disconnect_volume(&sys)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("context deadline exceeded"));
        // no sysfs teardown was attempted
        assert!(sys.written("state").is_none());
        assert!(sys.written("delete").is_none());
    }

    #[tokio::test]
    async fn discovery_and_chap_run_before_login() {
        let chap = Secrets {
            secrets_type: "chap".to_string(),
            user: "user".to_string(),
            pass: "pass".to_string(),
            ..Secrets::default()
        };
        let sys = FakeSystem::with_exec(scripted_exec(
            "",
            "sdb sdb  3:0:0:0 disk iscsi 10G\n",
        ))
        .with_path(&format!(
            "/dev/disk/by-path/ip-192.168.1.107:3260-iscsi-{IQN}-lun-0"
        ));

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["192.168.1.107".to_string()],
            discovery_secrets: chap.clone(),
            session_secrets: chap,
            do_discovery: true,
            do_chap_discovery: true,
            ..Connector::default()
        };

        connector.connect(&sys).await.unwrap();
        let commands = sys.commands();
        let discover = commands
            .iter()
            .position(|command| command.contains("-m discoverydb") && command.ends_with("--discover"))
            .expect("sendtargets discovery");
        let db_entry = commands
            .iter()
            .position(|command| command.contains("-m node") && command.ends_with("-o new"))
            .expect("node db entry");
        let chap_update = commands
            .iter()
            .position(|command| command.contains("node.session.auth.username"))
            .expect("session chap update");
        let login = commands
            .iter()
            .position(|command| command.ends_with(" -l"))
            .expect("login");
        assert!(discover < db_entry);
        assert!(db_entry < chap_update);
        assert!(chap_update < login);
    }

    #[tokio::test]
    async fn non_tcp_transport_resolves_the_pci_wildcard() {
        const ISER_RECORD: &str =
            "iface.iscsi_ifacename = iser0\niface.transport_name = iser\n";
        let sys = FakeSystem::with_exec(move |command, cmd_args| match command {
            "iscsiadm" if cmd_args.windows(2).any(|w| w == ["-o", "show"]) => out(ISER_RECORD),
            "iscsiadm" if cmd_args == ["-m", "session"] => {
                exit("iscsiadm", 21, "No active sessions.\n")
            }
            "iscsiadm" => out(""),
            "lsblk" => out("sdc sdc  4:0:0:0 disk iscsi 10G\n"),
            other => exit(other, 1, "unexpected command"),
        })
        .on_glob(move |pattern| {
            assert!(pattern.starts_with("/dev/disk/by-path/pci-*-ip-192.168.1.107:3260"));
            Ok(vec![format!(
                "/dev/disk/by-path/pci-0000:00:1f.2-ip-192.168.1.107:3260-iscsi-{IQN}-lun-0"
            )])
        });

        let mut connector = Connector {
            volume_name: "v1".to_string(),
            target_iqn: IQN.to_string(),
            target_portals: vec!["192.168.1.107".to_string()],
            interface: "iser0".to_string(),
            ..Connector::default()
        };

        let path = connector.connect(&sys).await.unwrap();
        assert_eq!(path, "/dev/sdc");
        // lsblk was asked about the glob-resolved path, not the wildcard
        assert!(sys
            .commands()
            .iter()
            .any(|command| command.contains("pci-0000:00:1f.2")));
    }

    #[tokio::test]
    async fn resize_volume_rescans_paths_and_resizes_the_map() {
        let sys = FakeSystem::new();
        let connector = multipath_connector();
        connector.resize_volume(&sys).await.unwrap();
        assert_eq!(
            sys.written("scsi_device/0:0:0:0/device/rescan").as_deref(),
            Some("1")
        );
        assert_eq!(
            sys.written("scsi_device/1:0:0:0/device/rescan").as_deref(),
            Some("1")
        );
        assert_eq!(
            sys.commands(),
            vec![format!("multipathd resize map {WWID}")]
        );
    }

    #[tokio::test]
    async fn resize_volume_on_a_single_path_only_rescans() {
        let sys = FakeSystem::new();
        let device = disk("sdb", "1:0:0:0", "");
        let connector = Connector {
            devices: vec![device.clone()],
            mount_target_device: Some(device),
            ..Connector::default()
        };
        connector.resize_volume(&sys).await.unwrap();
        assert_eq!(
            sys.written("scsi_device/1:0:0:0/device/rescan").as_deref(),
            Some("1")
        );
        assert!(sys.commands().is_empty());
    }

    #[tokio::test]
    async fn session_disconnect_deduplicates_portals() {
        let sys = FakeSystem::new();
        let connector = Connector {
            target_iqn: IQN.to_string(),
            target_portals: vec![
                "10.0.0.1:3260".to_string(),
                "10.0.0.1:3261".to_string(),
                "10.0.0.2".to_string(),
            ],
            ..Connector::default()
        };
        connector.disconnect(&sys).await.unwrap();

        let commands = sys.commands();
        let logouts: Vec<_> = commands
            .iter()
            .filter(|command| command.ends_with(" -u"))
            .collect();
        assert_eq!(logouts.len(), 2);
        let deletes: Vec<_> = commands
            .iter()
            .filter(|command| command == &&format!("iscsiadm -m node -T {IQN} -o delete"))
            .collect();
        assert_eq!(deletes.len(), 1);
    }

    mod consistency {
        use super::*;

        fn wwid_exec() -> impl Fn(&str, &[String]) -> Result<CommandOutput, Error> + Send + Sync
        {
            |command, cmd_args| {
                assert_eq!(command, "scsi_id");
                let path = cmd_args.last().unwrap().as_str();
                match path {
                    "/dev/mapper/3600c0ff0000000000000000000000000"
                    | "/dev/sda"
                    | "/dev/sdb" => out("3600c0ff0000000000000000000000000\n"),
                    "/dev/sdg" => out("3600c0ff0000000000000000000000024\n"),
                    _ => exit("scsi_id", 1, ""),
                }
            }
        }

        async fn check(
            mount_target: Device,
            devices: Vec<Device>,
        ) -> Result<(), Error> {
            let sys = FakeSystem::with_exec(wwid_exec());
            let connector = Connector {
                mount_target_device: Some(mount_target),
                devices,
                ..Connector::default()
            };
            connector.check_multipath_consistency(&sys).await
        }

        #[tokio::test]
        async fn consistent_aggregate_passes() {
            check(
                mpath(WWID, "10G"),
                vec![disk("sda", "1:0:0:1", "10G"), disk("sdb", "2:0:0:1", "10G")],
            )
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn sizes_must_match() {
            let error = check(
                mpath(WWID, "10G"),
                vec![disk("sda", "1:0:0:1", "10G"), disk("sdc", "1:0:0:2", "5G")],
            )
            .await
            .unwrap_err();
            assert!(error.to_string().contains("size differ"));
        }

        #[tokio::test]
        async fn hctl_must_parse() {
            let invalid = Device {
                name: "sde".to_string(),
                hctl: "2:b".to_string(),
                device_type: "disk".to_string(),
                size: "5G".to_string(),
                ..Device::default()
            };
            let error = check(invalid, Vec::new()).await.unwrap_err();
            assert!(error.to_string().contains("invalid HCTL"));
        }

        #[tokio::test]
        async fn luns_must_match() {
            let error = check(
                mpath(WWID, "10G"),
                vec![disk("sda", "1:0:0:1", "10G"), disk("sdf", "2:0:0:3", "10G")],
            )
            .await
            .unwrap_err();
            assert!(error.to_string().contains("LUNs differ"));
        }

        #[tokio::test]
        async fn controllers_must_be_distinct() {
            let error = check(
                mpath(WWID, "10G"),
                vec![disk("sda", "1:0:0:1", "10G"), disk("sdg", "1:0:0:1", "10G")],
            )
            .await
            .unwrap_err();
            assert!(error.to_string().contains("same controller"));
        }

        #[tokio::test]
        async fn wwid_lookup_must_succeed() {
            let error = check(
                mpath("3600c0ff0000000000000000000000042", "5G"),
                vec![disk("sdc", "1:0:0:2", "5G"), disk("sdd", "2:0:0:2", "5G")],
            )
            .await
            .unwrap_err();
            assert!(error.to_string().contains("could not find WWID"));
        }

        #[tokio::test]
        async fn wwids_must_match_the_aggregate_name() {
            let error = check(
                mpath(WWID, "10G"),
                vec![disk("sdb", "2:0:0:1", "10G"), disk("sdg", "1:0:0:1", "10G")],
            )
            .await
            .unwrap_err();
            assert!(error.to_string().contains("WWIDs differ"));
        }
    }
}
