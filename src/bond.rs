// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use netlink_packet_route::link::{
    InfoBond, InfoData, InfoKind, LinkAttribute, LinkInfo, LinkMessage,
};
use slog::Logger;

use crate::config::BondConfig;
use crate::error::BondError;
use crate::netlink::{Handle, Link};

/// The bond master device inside the target namespace.
pub struct BondDevice {
    logger: Logger,
    pub name: String,
    pub index: u32,
}

impl BondDevice {
    /// Creates the master device. Mode, monitoring interval and
    /// fail-over policy are applied by the kernel at creation time; the
    /// MTU is only programmed when explicitly configured.
    pub async fn create(logger: &Logger, handle: &Handle, config: &BondConfig) -> Result<Self> {
        let mut bond_info = vec![
            InfoBond::Mode(config.mode.to_netlink()),
            InfoBond::MiiMon(config.miimon),
            InfoBond::FailOverMac(config.fail_over_mac),
        ];
        if let Some(all_active) = config.all_slaves_active {
            bond_info.push(InfoBond::AllPortsActive(all_active as u8));
        }

        let mut message = LinkMessage::default();
        message
            .attributes
            .push(LinkAttribute::IfName(config.name.clone()));
        if let Some(mtu) = config.mtu {
            message.attributes.push(LinkAttribute::Mtu(mtu));
        }
        message.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Bond),
            LinkInfo::Data(InfoData::Bond(bond_info)),
        ]));
        let request = handle.raw().link().add(message);
        request.execute().await.map_err(|e| BondError::Device {
            device: config.name.clone(),
            reason: format!("create bond: {}", e),
        })?;

        let link = handle
            .get_link(&config.name)
            .await
            .context("read back created bond")?;
        let logger = logger.new(o!("subsystem" => "bond", "bond" => config.name.clone()));
        info!(
            logger,
            "created bond (index {}) mode {} miimon {}ms",
            link.index(),
            config.mode,
            config.miimon
        );
        Ok(Self {
            logger,
            name: config.name.clone(),
            index: link.index(),
        })
    }

    /// A handle onto an already existing bond device.
    pub fn from_link(logger: &Logger, link: &Link) -> Self {
        Self {
            logger: logger.new(o!("subsystem" => "bond", "bond" => link.name())),
            name: link.name(),
            index: link.index(),
        }
    }

    /// Enslaves the links in order. Each slave is downed, pointed at the
    /// master and brought back up. The first failure aborts and leaves
    /// the earlier slaves attached; teardown is the recovery path.
    pub async fn attach(&self, handle: &Handle, slaves: &[Link]) -> Result<()> {
        for slave in slaves {
            let name = slave.name();
            handle.set_link_down(slave.index(), &name).await?;
            handle.set_controller(slave.index(), &name, self.index).await?;
            handle.set_link_up(slave.index(), &name).await?;
            info!(self.logger, "attached slave {}", name);
        }
        Ok(())
    }

    pub async fn bring_up(&self, handle: &Handle) -> Result<()> {
        handle.set_link_up(self.index, &self.name).await
    }

    pub async fn set_down(&self, handle: &Handle) -> Result<()> {
        handle.set_link_down(self.index, &self.name).await
    }

    pub async fn delete(self, handle: &Handle) -> Result<()> {
        handle.del_link(self.index, &self.name).await?;
        info!(self.logger, "deleted bond");
        Ok(())
    }
}

/// Releases slaves from whatever master they are attached to and brings
/// them back up as standalone links.
pub async fn detach_slaves(logger: &Logger, handle: &Handle, slaves: &[Link]) -> Result<()> {
    for slave in slaves {
        let name = slave.name();
        handle.set_link_down(slave.index(), &name).await?;
        handle.clear_controller(slave.index(), &name).await?;
        handle.set_link_up(slave.index(), &name).await?;
        info!(logger, "detached slave {}", name);
    }
    Ok(())
}
