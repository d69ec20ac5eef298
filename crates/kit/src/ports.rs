//! Host port allocation for multiple instances.
//!
//! Instance `i` uses `base + i` for every port category.

use std::collections::HashMap;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

/// Fixed guest-side ports reached through host forwarding.
pub const GUEST_SSH_PORT: u16 = 22;
pub const GUEST_HTTP_PORT: u16 = 80;
pub const GUEST_KUBERNETES_PORT: u16 = 6443;
pub const GUEST_K0S_PORT: u16 = 9443;

/// First TCP port of VNC display `:0`.
pub const VNC_BASE_PORT: u16 = 5900;

/// Base ports parsed from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasePorts {
    pub ssh: u16,
    pub vnc: u16,
    pub docker: u16,
    pub http: u16,
    pub kubernetes: u16,
    pub k0s: u16,
}

/// Host ports of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstancePorts {
    pub ssh: u16,
    pub vnc: u16,
    pub docker: u16,
    pub http: u16,
    pub kubernetes: u16,
    pub k0s: u16,
}

fn parse_port(field: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(field, value, "not a port number"))
}

impl BasePorts {
    pub fn parse(network: &NetworkConfig) -> Result<Self> {
        Ok(Self {
            ssh: parse_port("network.sshPort", &network.ssh_port)?,
            vnc: parse_port("network.vncPort", &network.vnc_port)?,
            docker: parse_port("network.dockerPort", &network.docker_port)?,
            http: parse_port("network.httpPort", &network.http_port)?,
            kubernetes: parse_port("network.kubernetesPort", &network.kubernetes_port)?,
            k0s: parse_port("network.k0sPort", &network.k0s_port)?,
        })
    }

    /// Ports of instance `index`; fails if any of them exceeds 65535.
    pub fn derive(&self, index: usize) -> Result<InstancePorts> {
        let offset = |field: &str, base: u16| -> Result<u16> {
            u16::try_from(index)
                .ok()
                .and_then(|i| base.checked_add(i))
                .ok_or_else(|| {
                    Error::config(
                        field,
                        base.to_string(),
                        format!("port overflows for instance {}", index + 1),
                    )
                })
        };
        Ok(InstancePorts {
            ssh: offset("network.sshPort", self.ssh)?,
            vnc: offset("network.vncPort", self.vnc)?,
            docker: offset("network.dockerPort", self.docker)?,
            http: offset("network.httpPort", self.http)?,
            kubernetes: offset("network.kubernetesPort", self.kubernetes)?,
            k0s: offset("network.k0sPort", self.k0s)?,
        })
    }

    /// Derive the ports of `count` instances, rejecting any host port that
    /// would be used twice.
    pub fn allocate(&self, count: usize) -> Result<Vec<InstancePorts>> {
        let all = (0..count).map(|i| self.derive(i)).collect::<Result<Vec<_>>>()?;
        let mut owners: HashMap<u16, (usize, &'static str)> = HashMap::new();
        for (i, ports) in all.iter().enumerate() {
            for (category, port) in ports.labeled() {
                if let Some((other, other_category)) = owners.insert(port, (i, category)) {
                    return Err(Error::config(
                        "network",
                        port.to_string(),
                        format!(
                            "host port used by both instance {} ({other_category}) and instance {} ({category}); space base ports at least {count} apart",
                            other + 1,
                            i + 1,
                        ),
                    ));
                }
            }
        }
        Ok(all)
    }
}

impl InstancePorts {
    fn labeled(&self) -> [(&'static str, u16); 6] {
        [
            ("ssh", self.ssh),
            ("vnc", self.vnc),
            ("docker", self.docker),
            ("http", self.http),
            ("kubernetes", self.kubernetes),
            ("k0s", self.k0s),
        ]
    }

    /// VNC display number for `-vnc :<display>`.
    pub fn vnc_display(&self) -> Result<u16> {
        self.vnc.checked_sub(VNC_BASE_PORT).ok_or_else(|| {
            Error::config(
                "network.vncPort",
                self.vnc.to_string(),
                format!("VNC ports start at {VNC_BASE_PORT}"),
            )
        })
    }

    /// User-mode network forwards, `hostfwd=tcp::<host>-:<guest>` each.
    pub fn host_forwards(&self) -> String {
        [
            (self.ssh, GUEST_SSH_PORT),
            // The in-guest forwarder listens on the instance's own port
            (self.docker, self.docker),
            (self.http, GUEST_HTTP_PORT),
            (self.kubernetes, GUEST_KUBERNETES_PORT),
            (self.k0s, GUEST_K0S_PORT),
        ]
        .iter()
        .map(|(host, guest)| format!("hostfwd=tcp::{host}-:{guest}"))
        .collect::<Vec<_>>()
        .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> BasePorts {
        BasePorts::parse(&NetworkConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_defaults() {
        assert_eq!(
            defaults(),
            BasePorts {
                ssh: 2222,
                vnc: 5900,
                docker: 2377,
                http: 80,
                kubernetes: 6443,
                k0s: 9443,
            }
        );
    }

    #[test]
    fn test_non_numeric_port_names_field() {
        let network = NetworkConfig {
            ssh_port: "twenty-two".into(),
            ..Default::default()
        };
        match BasePorts::parse(&network) {
            Err(Error::Configuration { field, value, .. }) => {
                assert_eq!(field, "network.sshPort");
                assert_eq!(value, "twenty-two");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_derive_offsets_every_category() {
        let base = defaults();
        for i in 0..5usize {
            let p = base.derive(i).unwrap();
            let off = i as u16;
            assert_eq!(p.ssh, 2222 + off);
            assert_eq!(p.vnc, 5900 + off);
            assert_eq!(p.docker, 2377 + off);
            assert_eq!(p.http, 80 + off);
            assert_eq!(p.kubernetes, 6443 + off);
            assert_eq!(p.k0s, 9443 + off);
            assert_eq!(p.vnc_display().unwrap(), off);
        }
    }

    #[test]
    fn test_allocate_disjoint() {
        let all = defaults().allocate(3).unwrap();
        assert_eq!(
            all.iter().map(|p| p.ssh).collect::<Vec<_>>(),
            [2222, 2223, 2224]
        );
    }

    #[test]
    fn test_allocate_rejects_collisions() {
        let mut base = defaults();
        base.docker = 2223;
        // Single instance: no overlap
        base.allocate(1).unwrap();
        // Instance 2's ssh (2223) hits instance 1's docker port
        let err = base.allocate(2).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }), "{err}");
    }

    #[test]
    fn test_overflow() {
        let mut base = defaults();
        base.k0s = u16::MAX;
        base.derive(0).unwrap();
        assert!(matches!(
            base.derive(1),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_vnc_below_display_zero() {
        let mut base = defaults();
        base.vnc = 5800;
        let ports = base.derive(0).unwrap();
        assert!(ports.vnc_display().is_err());
    }

    #[test]
    fn test_host_forwards() {
        let p = defaults().derive(1).unwrap();
        assert_eq!(
            p.host_forwards(),
            "hostfwd=tcp::2223-:22,hostfwd=tcp::2378-:2378,hostfwd=tcp::81-:80,hostfwd=tcp::6444-:6443,hostfwd=tcp::9444-:9443"
        );
    }
}
