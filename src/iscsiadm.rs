//! Typed wrapper over the open-iscsi administration utility.
//!
//! Every invocation is bounded by a 3 second wall clock; a wedged daemon
//! surfaces as a timeout rather than hanging the engine.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, InitiatorStage},
    system::System,
};

const ISCSIADM: &str = "iscsiadm";
/// Wall-clock budget for one initiator invocation.
const INITIATOR_TIMEOUT: Duration = Duration::from_secs(3);

static TRANSPORT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"iface\.transport_name\s*=\s*(.*)\n").unwrap());

/// CHAP credentials for one authentication phase. A `type` of `chap` enables
/// the phase; the `*_in` fields configure bidirectional CHAP and are only
/// written when non-empty.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub secrets_type: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_in: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pass_in: String,
}

impl Secrets {
    /// True when these credentials request CHAP authentication.
    pub fn is_chap(&self) -> bool {
        self.secrets_type == "chap"
    }
}

// Credential values must never reach logs or error text.
impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("type", &self.secrets_type)
            .field("user", &"<redacted>")
            .field("pass", &"<redacted>")
            .field("user_in", &"<redacted>")
            .field("pass_in", &"<redacted>")
            .finish()
    }
}

/// One row of `iscsiadm -m session` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IscsiSession {
    pub protocol: String,
    pub id: i32,
    pub portal: String,
    pub iqn: String,
    /// Suffix of the IQN after its last colon.
    pub name: String,
}

/// Parse the raw session listing. One session per non-empty line; lines with
/// fewer than four whitespace-separated fields are skipped (the tool emits
/// blank separator lines).
pub(crate) fn parse_sessions(output: &str) -> Vec<IscsiSession> {
    let mut sessions = Vec::new();
    for line in output.trim().lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let protocol = fields[0].split(':').next().unwrap_or_default().to_string();
        let id = fields[1]
            .trim_matches(|c| c == '[' || c == ']')
            .parse()
            .unwrap_or_default();
        let portal = fields[2].split(',').next().unwrap_or_default().to_string();
        let iqn = fields[3].to_string();
        let name = iqn
            .rsplit_once(':')
            .map(|(_, name)| name.to_string())
            .unwrap_or_default();
        sessions.push(IscsiSession {
            protocol,
            id,
            portal,
            iqn,
            name,
        });
    }
    sessions
}

/// Extract the transport name from an interface record. An empty value means
/// the default transport `tcp`; a record without the key yields an empty
/// string.
pub(crate) fn extract_transport(output: &str) -> String {
    match TRANSPORT_NAME.captures(output) {
        Some(captures) => {
            let transport = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            if transport.is_empty() {
                "tcp".to_string()
            } else {
                transport.to_string()
            }
        }
        None => String::new(),
    }
}

/// Thin, typed client for the node's iSCSI initiator utility.
pub struct IscsiAdm<'a> {
    sys: &'a dyn System,
}

impl<'a> IscsiAdm<'a> {
    pub fn new(sys: &'a dyn System) -> Self {
        Self { sys }
    }

    async fn iscsi_cmd(&self, args: Vec<String>) -> Result<String, Error> {
        debug!(command = %format!("{ISCSIADM} {}", args.join(" ")), "running initiator command");
        self.run_raw(args).await
    }

    async fn run_raw(&self, args: Vec<String>) -> Result<String, Error> {
        let output = self
            .sys
            .run(ISCSIADM, &args, Some(INITIATOR_TIMEOUT))
            .await?;
        Ok(output.stdout)
    }

    /// List all configured initiator interface records.
    pub async fn list_interfaces(&self) -> Result<Vec<String>, Error> {
        let out = self.iscsi_cmd(args(&["-m", "iface", "-o", "show"])).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Show the record of one initiator interface.
    pub async fn show_interface(&self, iface: &str) -> Result<String, Error> {
        self.iscsi_cmd(args(&["-m", "iface", "-o", "show", "-I", iface]))
            .await
    }

    /// List the active sessions on the node.
    pub async fn get_sessions(&self) -> Result<Vec<IscsiSession>, Error> {
        match self.iscsi_cmd(args(&["-m", "session"])).await {
            Ok(out) => Ok(parse_sessions(&out)),
            Err(error) if error.is_no_sessions() => Ok(Vec::new()),
            Err(error) => Err(error),
        }
    }

    /// True when a session to `(portal, iqn)` is already established.
    pub async fn session_exists(&self, portal: &str, iqn: &str) -> Result<bool, Error> {
        let sessions = self.get_sessions().await?;
        Ok(sessions
            .iter()
            .any(|session| session.portal == portal && session.iqn == iqn))
    }

    /// Build the discovery DB record for `portal` and run sendtargets
    /// against it, with CHAP on the discovery phase when requested.
    pub async fn discoverydb(
        &self,
        portal: &str,
        iface: &str,
        secrets: &Secrets,
        chap_discovery: bool,
    ) -> Result<(), Error> {
        let base = args(&[
            "-m",
            "discoverydb",
            "-t",
            "sendtargets",
            "-p",
            portal,
            "-I",
            iface,
        ]);
        self.iscsi_cmd(with(&base, &["-o", "new"]))
            .await
            .map_err(|error| stage_error(InitiatorStage::Discovery, error))?;
        if chap_discovery {
            self.update_chap(&base, secrets, true)
                .await
                .map_err(|error| stage_error(InitiatorStage::Discovery, error))?;
        }
        if let Err(error) = self.iscsi_cmd(with(&base, &["--discover"])).await {
            // drop the half-built discovery record
            let _ = self.iscsi_cmd(with(&base, &["-o", "delete"])).await;
            return Err(stage_error(InitiatorStage::Discovery, error));
        }
        Ok(())
    }

    /// Create the node DB entry for the target, wiring CHAP for each phase
    /// whose secrets request it.
    pub async fn create_db_entry(
        &self,
        iqn: &str,
        portal: &str,
        iface: &str,
        discovery_secrets: &Secrets,
        session_secrets: &Secrets,
    ) -> Result<(), Error> {
        let base = args(&["-m", "node", "-T", iqn, "-p", portal]);
        self.iscsi_cmd(with(&base, &["-I", iface, "-o", "new"]))
            .await
            .map_err(|error| stage_error(InitiatorStage::DbEntry, error))?;
        if discovery_secrets.is_chap() {
            debug!("setting CHAP discovery credentials");
            self.update_chap(&base, discovery_secrets, true)
                .await
                .map_err(|error| stage_error(InitiatorStage::DbEntry, error))?;
        }
        if session_secrets.is_chap() {
            debug!("setting CHAP session credentials");
            self.update_chap(&base, session_secrets, false)
                .await
                .map_err(|error| stage_error(InitiatorStage::DbEntry, error))?;
        }
        Ok(())
    }

    async fn update_chap(
        &self,
        base: &[String],
        secrets: &Secrets,
        discovery: bool,
    ) -> Result<(), Error> {
        let prefix = if discovery {
            "discovery.sendtargets.auth"
        } else {
            "node.session.auth"
        };
        let mut cmd = base.to_vec();
        cmd.extend(args(&[
            "-o",
            "update",
            "-n",
            &format!("{prefix}.authmethod"),
            "-v",
            "CHAP",
            "-n",
            &format!("{prefix}.username"),
            "-v",
            &secrets.user,
            "-n",
            &format!("{prefix}.password"),
            "-v",
            &secrets.pass,
        ]));
        if !secrets.user_in.is_empty() {
            cmd.extend(args(&[
                "-n",
                &format!("{prefix}.username_in"),
                "-v",
                &secrets.user_in,
            ]));
        }
        if !secrets.pass_in.is_empty() {
            cmd.extend(args(&[
                "-n",
                &format!("{prefix}.password_in"),
                "-v",
                &secrets.pass_in,
            ]));
        }
        // the command line carries credential values, log the phase only
        debug!(%prefix, "updating CHAP credentials");
        self.run_raw(cmd).await.map(drop)
    }

    /// Log in to the target over the given portal.
    pub async fn login(&self, iqn: &str, portal: &str) -> Result<(), Error> {
        let base = args(&["-m", "node", "-T", iqn, "-p", portal]);
        if let Err(error) = self.iscsi_cmd(with(&base, &["-l"])).await {
            // a half-created node record confuses later retries
            let _ = self.iscsi_cmd(with(&base, &["-o", "delete"])).await;
            return Err(stage_error(InitiatorStage::Login, error));
        }
        Ok(())
    }

    /// Log out from the target over the given portal.
    pub async fn logout(&self, iqn: &str, portal: &str) -> Result<(), Error> {
        self.iscsi_cmd(args(&["-m", "node", "-T", iqn, "-p", portal, "-u"]))
            .await
            .map(drop)
            .map_err(|error| stage_error(InitiatorStage::Logout, error))
    }

    /// Logout without a wall-clock bound, used after a rescan timeout when
    /// the daemon may be wedged and the bounded path would time out again.
    pub(crate) async fn logout_unbounded(&self, iqn: &str, portal: &str) -> Result<(), Error> {
        let cmd = args(&["-m", "node", "-T", iqn, "-p", portal, "-u"]);
        debug!(command = %format!("{ISCSIADM} {}", cmd.join(" ")), "running initiator command");
        self.sys
            .run(ISCSIADM, &cmd, None)
            .await
            .map(drop)
            .map_err(|error| stage_error(InitiatorStage::Logout, error))
    }

    /// Delete the node DB entry for the target.
    pub async fn delete_db_entry(&self, iqn: &str) -> Result<(), Error> {
        self.iscsi_cmd(args(&["-m", "node", "-T", iqn, "-o", "delete"]))
            .await
            .map(drop)
            .map_err(|error| stage_error(InitiatorStage::DbEntry, error))
    }

    /// Delete an initiator interface record.
    pub async fn delete_iface(&self, iface: &str) -> Result<(), Error> {
        self.iscsi_cmd(args(&["-m", "iface", "-I", iface, "-o", "delete"]))
            .await
            .map(drop)
            .map_err(|error| stage_error(InitiatorStage::DeleteIface, error))
    }

    /// Rescan the session to pick up newly mapped LUNs. The interface is not
    /// passed so no additional session is established against the target.
    pub async fn rescan_node(&self, iqn: &str, portal: &str) -> Result<(), Error> {
        self.iscsi_cmd(args(&["-m", "node", "-T", iqn, "-p", portal, "-R"]))
            .await
            .map(drop)
            .map_err(|error| stage_error(InitiatorStage::Rescan, error))
    }
}

fn stage_error(stage: InitiatorStage, source: Error) -> Error {
    Error::Initiator {
        stage,
        source: Box::new(source),
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn with(base: &[String], extra: &[&str]) -> Vec<String> {
    let mut all = base.to_vec();
    all.extend(extra.iter().map(|value| value.to_string()));
    all
}
