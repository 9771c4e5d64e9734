// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashSet;

use netlink_packet_route::link::BondMode as NetlinkBondMode;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::BondError;

/// Kernel bonding modes, spelled the way the bonding driver spells them.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum BondMode {
    #[serde(rename = "balance-rr")]
    #[strum(serialize = "balance-rr")]
    BalanceRr,
    #[serde(rename = "active-backup")]
    #[strum(serialize = "active-backup")]
    ActiveBackup,
    #[serde(rename = "balance-xor")]
    #[strum(serialize = "balance-xor")]
    BalanceXor,
    #[serde(rename = "broadcast")]
    #[strum(serialize = "broadcast")]
    Broadcast,
    #[serde(rename = "802.3ad")]
    #[strum(serialize = "802.3ad")]
    Ieee8023ad,
    #[serde(rename = "balance-tlb")]
    #[strum(serialize = "balance-tlb")]
    BalanceTlb,
    #[serde(rename = "balance-alb")]
    #[strum(serialize = "balance-alb")]
    BalanceAlb,
}

impl BondMode {
    pub(crate) fn to_netlink(self) -> NetlinkBondMode {
        match self {
            Self::BalanceRr => NetlinkBondMode::BalanceRr,
            Self::ActiveBackup => NetlinkBondMode::ActiveBackup,
            Self::BalanceXor => NetlinkBondMode::BalanceXor,
            Self::Broadcast => NetlinkBondMode::Broadcast,
            Self::Ieee8023ad => NetlinkBondMode::Ieee8023Ad,
            Self::BalanceTlb => NetlinkBondMode::BalanceTlb,
            Self::BalanceAlb => NetlinkBondMode::BalanceAlb,
        }
    }
}

/// Bonding parameters for one invocation, as handed over by the runtime
/// configuration layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondConfig {
    /// Name of the bond device to manage inside the target namespace.
    pub name: String,
    pub mode: BondMode,
    /// Link monitoring interval in milliseconds.
    pub miimon: u32,
    /// Bonding driver failOverMac policy (0 none, 1 active, 2 follow).
    #[serde(default)]
    pub fail_over_mac: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_slaves_active: Option<bool>,
    /// Names of the links to enslave, in order.
    pub links: Vec<String>,
    /// Whether the slaves already live in the target namespace. When
    /// false they are moved in from the invoking namespace on setup and
    /// moved back on teardown.
    #[serde(default)]
    pub links_in_container: bool,
}

impl BondConfig {
    pub fn validate(&self) -> Result<(), BondError> {
        if self.name.is_empty() {
            return Err(BondError::Config("bond device name is empty".to_string()));
        }
        if self.links.len() < 2 {
            return Err(BondError::InsufficientLinks(self.links.len()));
        }
        let mut seen = HashSet::new();
        for link in &self.links {
            if !seen.insert(link.as_str()) {
                return Err(BondError::Config(format!(
                    "slave link {} listed more than once",
                    link
                )));
            }
        }
        if self.fail_over_mac > 2 {
            return Err(BondError::FailOverMacRange(self.fail_over_mac));
        }
        Ok(())
    }
}
