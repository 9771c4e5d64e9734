// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::BondError;
use crate::netlink::Link;

pub fn format_mac_addr(b: &[u8]) -> Result<String> {
    if b.len() != 6 {
        return Err(anyhow!("invalid mac address {:?}", b));
    }
    Ok(format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    ))
}

pub fn parse_mac_addr(s: &str) -> Option<[u8; 6]> {
    let v: Vec<_> = s.split(':').collect();
    if v.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for i in 0..6 {
        bytes[i] = u8::from_str_radix(v[i], 16).ok()?;
    }
    Some(bytes)
}

/// Generates a locally administered unicast hardware address from the
/// operating system's randomness source.
pub fn generate_private_mac_addr() -> Result<[u8; 6]> {
    let mut buf = [0u8; 6];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| BondError::MacGeneration(e.to_string()))?;
    // locally administered, unicast
    buf[0] = (buf[0] | 0x02) & 0xfe;
    Ok(buf)
}

/// A planned hardware address change for one link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacRewrite {
    pub index: u32,
    pub name: String,
    pub addr: [u8; 6],
}

/// Scans the links in order and plans a fresh address for every link
/// whose address repeats an earlier one. The bonding driver refuses or
/// misbehaves on duplicate slave addresses in the balance modes, and
/// fail-over policy 0 leaves copied addresses behind on teardown, so
/// both workflows run this over their link sets.
pub fn plan_mac_rewrites(links: &[Link]) -> Result<Vec<MacRewrite>> {
    let mut in_use: Vec<Vec<u8>> = Vec::new();
    let mut rewrites = Vec::new();
    for link in links {
        match link.hardware_addr() {
            Some(addr) if in_use.contains(&addr) => {
                let fresh = generate_unused_mac(&in_use)?;
                in_use.push(fresh.to_vec());
                rewrites.push(MacRewrite {
                    index: link.index(),
                    name: link.name(),
                    addr: fresh,
                });
            }
            Some(addr) => in_use.push(addr),
            None => (),
        }
    }
    Ok(rewrites)
}

fn generate_unused_mac(in_use: &[Vec<u8>]) -> Result<[u8; 6]> {
    loop {
        let addr = generate_private_mac_addr()?;
        if !in_use.iter().any(|used| used[..] == addr[..]) {
            return Ok(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::test_link;

    #[test]
    fn test_format_and_parse_mac_addr() {
        let addr = [0x02, 0xab, 0x00, 0x11, 0x22, 0x33];
        let s = format_mac_addr(&addr).unwrap();
        assert_eq!(s, "02:ab:00:11:22:33");
        assert_eq!(parse_mac_addr(&s), Some(addr));

        assert!(format_mac_addr(&[1, 2, 3]).is_err());
        assert_eq!(parse_mac_addr("not-a-mac"), None);
        assert_eq!(parse_mac_addr("02:ab:00:11:22"), None);
        assert_eq!(parse_mac_addr("zz:ab:00:11:22:33"), None);
    }

    #[test]
    fn test_generated_addr_is_private_unicast() {
        for _ in 0..64 {
            let addr = generate_private_mac_addr().unwrap();
            assert_eq!(addr[0] & 0x02, 0x02, "locally administered bit");
            assert_eq!(addr[0] & 0x01, 0x00, "unicast bit");
        }
    }

    #[test]
    fn test_plan_leaves_distinct_addrs_alone() {
        let links = vec![
            test_link(1, "net1", 1500, &[0x02, 0, 0, 0, 0, 1]),
            test_link(2, "net2", 1500, &[0x02, 0, 0, 0, 0, 2]),
        ];
        assert!(plan_mac_rewrites(&links).unwrap().is_empty());
    }

    #[test]
    fn test_plan_rewrites_later_duplicates() {
        let dup = [0x02, 0, 0, 0, 0, 1];
        let links = vec![
            test_link(1, "net1", 1500, &dup),
            test_link(2, "net2", 1500, &dup),
            test_link(3, "net3", 1500, &dup),
        ];
        let rewrites = plan_mac_rewrites(&links).unwrap();

        // the first holder keeps its address
        assert_eq!(rewrites.len(), 2);
        assert_eq!(rewrites[0].name, "net2");
        assert_eq!(rewrites[1].name, "net3");
        for rewrite in &rewrites {
            assert_ne!(rewrite.addr, dup);
            assert_eq!(rewrite.addr[0] & 0x03, 0x02);
        }
        assert_ne!(rewrites[0].addr, rewrites[1].addr);
    }

    #[test]
    fn test_plan_skips_links_without_addr() {
        let links = vec![
            test_link(1, "net1", 1500, &[]),
            test_link(2, "net2", 1500, &[]),
        ];
        assert!(plan_mac_rewrites(&links).unwrap().is_empty());
    }
}
