//! Deterministic VM addressing.
//!
//! A VM's addresses are computed from its server's addresses and its slot on
//! that server, never looked up. For a server at `A.B.C.D`, slot `i` gets
//! `A.B.(C+1+i).D`; the iSCSI address follows the same rule on the server's
//! iSCSI address. MACs encode `C`, `D` and `i` so they are unique fleet-wide.

use std::net::Ipv4Addr;

use crate::error::{DirectorError, Result};
use crate::records::{VmNetwork, VmSoftwareSpec};

/// First kernel debug port handed out; slot `i` gets `BASE + i`.
pub const KERNEL_DEBUG_PORT_BASE: u16 = 53000;

fn parse(ip: &str) -> Result<Ipv4Addr> {
    ip.parse::<Ipv4Addr>()
        .map_err(|_| DirectorError::InvalidRequest(format!("'{}' is not an IPv4 address", ip)))
}

fn shifted(ip: &str, index: u32) -> Result<Ipv4Addr> {
    let [a, b, c, d] = parse(ip)?.octets();
    let third = u32::from(c) + 1 + index;
    let third = u8::try_from(third).map_err(|_| {
        DirectorError::InvalidRequest(format!("slot {} does not fit under {}", index, ip))
    })?;
    Ok(Ipv4Addr::new(a, b, third, d))
}

/// IP of the VM in slot `index` of the server at `server_ip`.
pub fn vm_ip(server_ip: &str, index: u32) -> Result<String> {
    Ok(shifted(server_ip, index)?.to_string())
}

/// Full network identity of a VM.
pub fn vm_network(server_ip: &str, server_iscsi_ip: &str, index: u32, software: &VmSoftwareSpec) -> Result<VmNetwork> {
    let [_, _, c, d] = parse(server_ip)?.octets();
    let slot = u8::try_from(index)
        .map_err(|_| DirectorError::InvalidRequest(format!("slot {} out of range", index)))?;
    let ip = shifted(server_ip, index)?;

    Ok(VmNetwork {
        display_name: format!("vm_{}", ip.to_string().replace('.', "_")),
        eth0_mac: format!("00:50:56:{:02x}:{:02x}:{:02x}", c, d, slot),
        eth1_mac: format!("00:50:57:{:02x}:{:02x}:{:02x}", c, d, slot),
        iscsi_ip: shifted(server_iscsi_ip, index)?.to_string(),
        kernel_debug_port: software
            .debugger_port
            .unwrap_or(KERNEL_DEBUG_PORT_BASE + u16::from(slot)),
        kernel_debug_key: software
            .debugger_key
            .clone()
            .unwrap_or_else(|| format!("labdirector.key.{}.{}.{}", c, d, slot)),
    })
}

/// Lowest slot not in `taken`.
pub fn free_slot(taken: &[u32]) -> u32 {
    (0..).find(|slot| !taken.contains(slot)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_follow_the_slot() {
        assert_eq!(vm_ip("10.0.1.7", 0).unwrap(), "10.0.2.7");
        assert_eq!(vm_ip("10.0.1.7", 4).unwrap(), "10.0.6.7");

        let network = vm_network("10.0.1.7", "192.168.1.7", 2, &VmSoftwareSpec::default()).unwrap();
        assert_eq!(network.iscsi_ip, "192.168.4.7");
        assert_eq!(network.eth0_mac, "00:50:56:01:07:02");
        assert_eq!(network.eth1_mac, "00:50:57:01:07:02");
        assert_eq!(network.kernel_debug_port, KERNEL_DEBUG_PORT_BASE + 2);
        assert_eq!(network.display_name, "vm_10_0_4_7");
    }

    #[test]
    fn requested_debugger_settings_win() {
        let software = VmSoftwareSpec {
            debugger_port: Some(50001),
            debugger_key: Some("a.b.c.d".into()),
            snapshot: None,
        };
        let network = vm_network("10.0.1.7", "10.0.1.7", 0, &software).unwrap();
        assert_eq!(network.kernel_debug_port, 50001);
        assert_eq!(network.kernel_debug_key, "a.b.c.d");
    }

    #[test]
    fn overflow_and_garbage_are_rejected() {
        assert!(vm_ip("10.0.250.7", 10).is_err());
        assert!(vm_ip("blade-7", 0).is_err());
    }

    #[test]
    fn lowest_free_slot() {
        assert_eq!(free_slot(&[]), 0);
        assert_eq!(free_slot(&[0, 1, 3]), 2);
    }
}
