//! Machine identity and platform probes used by workers and clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a physical host, derived from its MAC addresses.
/// Two workers running on the same host share an id.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId(String);

impl MachineId {
    pub fn new(raw: impl Into<String>) -> MachineId {
        MachineId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convenient wrapper for id & host, used in logs and monitor output.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MachineName {
    pub id: MachineId,
    pub host: String,
}

impl fmt::Display for MachineName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.host, self.id)
    }
}

/// Unique id of a scheduler request, used only to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> RequestId {
        RequestId(rand::random())
    }
}

impl Default for RequestId {
    fn default() -> RequestId {
        RequestId::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub fn hostname_string() -> crate::Result<String> {
    gethostname::gethostname()
        .into_string()
        .map_err(|_| crate::Error::GenericError("hostname is not valid UTF-8".into()))
}

/// Returns the id of this machine. Falls back to the hostname on machines
/// where no usable MAC address can be found.
pub fn get_machine_id() -> MachineId {
    let macs = collect_mac_addresses();
    if macs.is_empty() {
        return MachineId::new(hostname_string().unwrap_or_else(|_| "unknown".to_string()));
    }
    machine_id_from_macs(macs)
}

fn machine_id_from_macs(mut macs: Vec<String>) -> MachineId {
    macs.sort();
    macs.dedup();
    MachineId::new(macs.join("-"))
}

fn collect_mac_addresses() -> Vec<String> {
    let ifaddrs = match nix::ifaddrs::getifaddrs() {
        Ok(ifaddrs) => ifaddrs,
        Err(e) => {
            log::error!("Could not list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut macs = Vec::new();
    for ifaddr in ifaddrs {
        let address = match ifaddr.address {
            Some(address) => address,
            None => continue,
        };
        if let Some(link) = address.as_link_addr() {
            match link.addr() {
                // The loopback device reports an all-zero address
                Some(mac) if mac != [0u8; 6] => {
                    let mac = mac
                        .iter()
                        .map(|byte| format!("{:02x}", byte))
                        .collect::<Vec<_>>()
                        .join(":");
                    macs.push(mac);
                }
                _ => continue,
            }
        }
    }
    macs
}

/// Returns the 1 minute system load average.
pub fn get_load_average() -> crate::Result<f64> {
    let data = std::fs::read_to_string("/proc/loadavg")?;
    parse_load_average(&data)
}

fn parse_load_average(data: &str) -> crate::Result<f64> {
    let first = data
        .split_whitespace()
        .next()
        .ok_or_else(|| crate::Error::GenericError("empty /proc/loadavg".into()))?;
    first
        .parse::<f64>()
        .map_err(|e| crate::Error::GenericError(format!("malformed /proc/loadavg: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::{get_machine_id, machine_id_from_macs, parse_load_average, MachineName};
    use crate::machine::MachineId;

    #[test]
    fn machine_id_is_stable_across_mac_order() {
        let a = machine_id_from_macs(vec!["0a:0b".to_string(), "01:02".to_string()]);
        let b = machine_id_from_macs(vec!["01:02".to_string(), "0a:0b".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "01:02-0a:0b");
    }

    #[test]
    fn machine_id_not_empty() {
        assert!(!get_machine_id().as_str().is_empty());
    }

    #[test]
    fn machine_name_display() {
        let name = MachineName {
            id: MachineId::new("aa:bb"),
            host: "smith".to_string(),
        };
        assert_eq!(name.to_string(), "smith[aa:bb]");
    }

    #[test]
    fn load_average_parsing() {
        assert_eq!(
            parse_load_average("0.52 0.58 0.59 1/469 2218\n").unwrap(),
            0.52
        );
        assert!(parse_load_average("").is_err());
        assert!(parse_load_average("broken").is_err());
    }
}
