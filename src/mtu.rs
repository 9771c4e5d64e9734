// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use slog::Logger;

use crate::error::BondError;
use crate::netlink::Link;

pub const DEFAULT_MTU: u32 = 1500;
/// Lower bound imposed by the kernel for IPv4 operation.
pub const MIN_MTU: u32 = 68;

/// What the invoking namespace knows about one of its devices: its own
/// MTU and the addresses of the virtual functions it exposes.
#[derive(Clone, Debug)]
pub struct PfSnapshot {
    pub name: String,
    pub mtu: Option<u32>,
    pub vf_addrs: Vec<[u8; 6]>,
}

impl PfSnapshot {
    pub fn from_link(link: &Link) -> Self {
        Self {
            name: link.name(),
            mtu: link.mtu(),
            vf_addrs: link.vf_addresses(),
        }
    }
}

/// Checks the requested bond MTU against every slave that will carry it
/// and, for slaves backed by a virtual function, against the physical
/// function behind them. Slaves whose hardware address matches none of
/// the VF addresses in `host_snapshot` get no PF check; software devices
/// carry no VF metadata and their ceiling is unknowable from here.
pub fn validate_mtu(
    logger: &Logger,
    slaves: &[Link],
    requested: Option<u32>,
    host_snapshot: &[PfSnapshot],
) -> Result<u32> {
    let mtu = requested.unwrap_or(DEFAULT_MTU);
    if mtu < MIN_MTU {
        return Err(BondError::Mtu {
            mtu,
            reason: format!("should be {} or bigger", MIN_MTU),
        }
        .into());
    }

    for slave in slaves {
        if let Some(slave_mtu) = slave.mtu() {
            if mtu > slave_mtu {
                return Err(BondError::Mtu {
                    mtu,
                    reason: format!(
                        "bigger than that of slave link {} (MTU {})",
                        slave.name(),
                        slave_mtu
                    ),
                }
                .into());
            }
        }

        match find_physical_function(slave, host_snapshot) {
            Some(pf) => {
                if let Some(pf_mtu) = pf.mtu {
                    if mtu > pf_mtu {
                        return Err(BondError::Mtu {
                            mtu,
                            reason: format!(
                                "bigger than that of physical function {} (MTU {}) behind slave {}",
                                pf.name,
                                pf_mtu,
                                slave.name()
                            ),
                        }
                        .into());
                    }
                }
            }
            None => {
                debug!(
                    logger,
                    "no physical function found for {}, skipping its MTU ceiling",
                    slave.name()
                );
            }
        }
    }
    Ok(mtu)
}

fn find_physical_function<'a>(
    slave: &Link,
    host_snapshot: &'a [PfSnapshot],
) -> Option<&'a PfSnapshot> {
    let addr = slave.hardware_addr()?;
    host_snapshot
        .iter()
        .find(|pf| pf.vf_addrs.iter().any(|vf| vf[..] == addr[..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::test_link;

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn slaves(mtu1: u32, mtu2: u32) -> Vec<Link> {
        vec![
            test_link(1, "net1", mtu1, &[0x02, 0, 0, 0, 0, 1]),
            test_link(2, "net2", mtu2, &[0x02, 0, 0, 0, 0, 2]),
        ]
    }

    #[test]
    fn test_defaults_to_1500() {
        let mtu = validate_mtu(&test_logger(), &slaves(1500, 9000), None, &[]).unwrap();
        assert_eq!(mtu, DEFAULT_MTU);
    }

    #[test]
    fn test_rejects_below_minimum() {
        let err = validate_mtu(&test_logger(), &slaves(1500, 1500), Some(60), &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BondError>(),
            Some(BondError::Mtu { mtu: 60, .. })
        ));
    }

    #[test]
    fn test_rejects_mtu_above_slave() {
        let err = validate_mtu(&test_logger(), &slaves(1400, 1000), Some(1200), &[]).unwrap_err();
        match err.downcast_ref::<BondError>() {
            Some(BondError::Mtu { mtu, reason }) => {
                assert_eq!(*mtu, 1200);
                assert!(reason.contains("net2"), "reason: {}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_accepts_mtu_at_slave_limit() {
        let mtu = validate_mtu(&test_logger(), &slaves(1400, 1400), Some(1400), &[]).unwrap();
        assert_eq!(mtu, 1400);
    }

    #[test]
    fn test_rejects_mtu_above_physical_function() {
        let snapshot = vec![PfSnapshot {
            name: "enp6s0f0".to_string(),
            mtu: Some(1300),
            vf_addrs: vec![[0x02, 0, 0, 0, 0, 1]],
        }];
        let err =
            validate_mtu(&test_logger(), &slaves(9000, 9000), Some(1400), &snapshot).unwrap_err();
        match err.downcast_ref::<BondError>() {
            Some(BondError::Mtu { mtu, reason }) => {
                assert_eq!(*mtu, 1400);
                assert!(reason.contains("enp6s0f0"), "reason: {}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_ignores_devices_without_vf_match() {
        // a host device with VFs that back neither slave
        let snapshot = vec![PfSnapshot {
            name: "enp6s0f0".to_string(),
            mtu: Some(1300),
            vf_addrs: vec![[0x02, 0xff, 0, 0, 0, 9]],
        }];
        let mtu =
            validate_mtu(&test_logger(), &slaves(9000, 9000), Some(1400), &snapshot).unwrap();
        assert_eq!(mtu, 1400);
    }
}
