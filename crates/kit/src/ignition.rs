//! Ignition first-boot documents.
//!
//! Each instance receives a document creating the `core` user with the
//! project's SSH key and enabling four systemd units. The documents differ
//! only in the port the Docker TCP forwarder listens on.

use camino::Utf8Path;
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use indoc::{formatdoc, indoc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const IGNITION_VERSION: &str = "3.4.0";
pub const CORE_USER: &str = "core";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnitionConfig {
    pub ignition: IgnitionSection,
    pub passwd: PasswdSection,
    pub systemd: SystemdSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnitionSection {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswdSection {
    pub users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemdSection {
    pub units: Vec<SystemdUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemdUnit {
    pub name: String,
    pub enabled: bool,
    pub contents: String,
}

impl SystemdUnit {
    fn enabled(name: &str, contents: String) -> Self {
        Self {
            name: name.to_owned(),
            enabled: true,
            contents,
        }
    }
}

/// Build the document for one instance.
pub fn synthesize(public_key: &str, docker_port: u16) -> IgnitionConfig {
    let docker_setup = indoc! {"
        [Unit]
        Description=Enable and start Docker engine
        After=network-online.target
        Wants=network-online.target

        [Service]
        Type=oneshot
        RemainAfterExit=yes
        ExecStart=/usr/bin/systemctl enable docker.service
        ExecStart=/usr/bin/systemctl start docker.service

        [Install]
        WantedBy=multi-user.target
    "};
    let docker_tcp_proxy = formatdoc! {"
        [Unit]
        Description=Forward Docker socket over TCP
        After=docker.service
        Requires=docker.service

        [Service]
        Type=simple
        Restart=always
        RestartSec=5
        ExecStart=/usr/bin/socat TCP-LISTEN:{docker_port},bind=0.0.0.0,fork,reuseaddr UNIX-CONNECT:/var/run/docker.sock

        [Install]
        WantedBy=multi-user.target
    "};
    let disable_zincati = indoc! {"
        [Unit]
        Description=Disable Zincati automatic updates
        DefaultDependencies=no

        [Service]
        Type=oneshot
        RemainAfterExit=yes
        ExecStart=/usr/bin/systemctl mask zincati.service

        [Install]
        WantedBy=multi-user.target
    "};
    let setup_linger = indoc! {"
        [Unit]
        Description=Enable linger for user 'core' (start user manager at boot)
        After=network.target

        [Service]
        Type=oneshot
        ExecStart=/usr/bin/loginctl enable-linger core

        [Install]
        WantedBy=multi-user.target
    "};

    IgnitionConfig {
        ignition: IgnitionSection {
            version: IGNITION_VERSION.to_owned(),
        },
        passwd: PasswdSection {
            users: vec![User {
                name: CORE_USER.to_owned(),
                ssh_authorized_keys: vec![public_key.trim().to_owned()],
            }],
        },
        systemd: SystemdSection {
            units: vec![
                SystemdUnit::enabled("docker-setup.service", docker_setup.to_owned()),
                SystemdUnit::enabled("docker-tcp-proxy.service", docker_tcp_proxy),
                SystemdUnit::enabled("disable-zincati.service", disable_zincati.to_owned()),
                SystemdUnit::enabled("setup-linger-core.service", setup_linger.to_owned()),
            ],
        },
    }
}

impl IgnitionConfig {
    /// Serialize the document, verifying that it parses back to itself.
    pub fn render(&self) -> Result<Vec<u8>> {
        let buf = serde_json::to_vec(self).map_err(|e| Error::Serialization {
            detail: e.to_string(),
        })?;
        let parsed: IgnitionConfig =
            serde_json::from_slice(&buf).map_err(|e| Error::Serialization {
                detail: format!("generated JSON does not parse: {e}"),
            })?;
        if &parsed != self {
            return Err(Error::Serialization {
                detail: "document changed across a serialize/parse round trip".to_owned(),
            });
        }
        tracing::debug!("Ignition document validated ({} bytes)", buf.len());
        Ok(buf)
    }
}

/// Atomically write a rendered document to `path`.
pub fn write_document(path: &Utf8Path, rendered: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Utf8Path::new("."));
    let name = path.file_name().ok_or_else(|| {
        Error::fs(
            "write",
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        )
    })?;
    std::fs::create_dir_all(parent).map_err(|e| Error::fs("create directory", parent, e))?;
    let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
        .map_err(|e| Error::fs("open directory", parent, e))?;
    dir.atomic_write(name, rendered)
        .map_err(|e| Error::fs("write", path, e))?;
    Ok(())
}
