// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::thread;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use slog::Logger;
use tokio::runtime;

use crate::bond::{detach_slaves, BondDevice};
use crate::config::BondConfig;
use crate::mac::{format_mac_addr, plan_mac_rewrites};
use crate::mtu::{validate_mtu, PfSnapshot};
use crate::netlink::Handle;
use crate::netns::Netns;

/// The interface reported back to the caller after a successful setup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub mac: String,
    pub sandbox: String,
}

/// Drives bonded interface setup and teardown for one container
/// namespace.
pub struct Engine {
    config: BondConfig,
    netns_path: String,
    logger: Logger,
}

impl Engine {
    pub fn new(logger: &Logger, config: BondConfig, netns_path: &str) -> Self {
        Self {
            config,
            netns_path: netns_path.to_string(),
            logger: logger.new(o!("subsystem" => "engine")),
        }
    }

    /// Creates the bond and enslaves the configured links, reporting the
    /// resulting interface. Partially applied state stays in place on
    /// failure; `del` cleans it up.
    pub fn add(&self) -> Result<Interface> {
        let logger = self.logger.clone();
        let config = self.config.clone();
        let netns_path = self.netns_path.clone();
        // Entering a namespace binds to the calling OS thread, while an
        // async executor is free to migrate tasks between threads. The
        // whole workflow therefore runs to completion on one dedicated
        // thread driving a current-thread runtime.
        thread::spawn(move || -> Result<Interface> {
            let rt = runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .context("new runtime for bond setup")?;
            rt.block_on(add_impl(&logger, &config, &netns_path))
        })
        .join()
        .map_err(|e| anyhow!("join bond setup thread: {:?}", e))?
    }

    /// Tears the bond down and frees its slaves. Safe to repeat: state
    /// that is already gone is treated as removed.
    pub fn del(&self) -> Result<()> {
        let logger = self.logger.clone();
        let config = self.config.clone();
        let netns_path = self.netns_path.clone();
        thread::spawn(move || -> Result<()> {
            let rt = runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .context("new runtime for bond teardown")?;
            rt.block_on(del_impl(&logger, &config, &netns_path))
        })
        .join()
        .map_err(|e| anyhow!("join bond teardown thread: {:?}", e))?
    }
}

async fn add_impl(logger: &Logger, config: &BondConfig, netns_path: &str) -> Result<Interface> {
    config.validate()?;
    let container_ns = Netns::open(netns_path)?;

    // Handle in the invoking namespace, opened before any switch. It
    // serves the slave migration and the PF snapshot for VF-backed
    // slaves.
    let host_handle = Handle::new(logger)?;

    if !config.links_in_container {
        migrate_to_container(logger, &host_handle, &config.links, &container_ns).await?;
    }

    let handle = Handle::new_in_netns(logger, &container_ns)?;
    let slaves = handle.resolve_links(&config.links, false).await?;

    let host_snapshot: Vec<PfSnapshot> = host_handle
        .list_links()
        .await
        .context("snapshot invoking namespace")?
        .iter()
        .map(PfSnapshot::from_link)
        .collect();
    validate_mtu(logger, &slaves, config.mtu, &host_snapshot)?;

    let bond = BondDevice::create(logger, &handle, config).await?;

    for rewrite in plan_mac_rewrites(&slaves)? {
        info!(
            logger,
            "reassigning duplicated hardware address on {}", rewrite.name
        );
        handle
            .set_hardware_addr(rewrite.index, &rewrite.name, &rewrite.addr)
            .await?;
    }

    bond.attach(&handle, &slaves).await?;
    bond.bring_up(&handle).await?;

    // read back so the report reflects what the kernel settled on
    let bond_link = handle
        .get_link(&config.name)
        .await
        .context("read back bond")?;
    let mac = match bond_link.hardware_addr() {
        Some(addr) => format_mac_addr(&addr)?,
        None => String::new(),
    };
    Ok(Interface {
        name: config.name.clone(),
        mac,
        sandbox: netns_path.to_string(),
    })
}

async fn del_impl(logger: &Logger, config: &BondConfig, netns_path: &str) -> Result<()> {
    if netns_path.is_empty() {
        info!(logger, "no namespace recorded, nothing to tear down");
        return Ok(());
    }
    let container_ns = Netns::open(netns_path)?;
    let handle = Handle::new_in_netns(logger, &container_ns)?;

    if let Some(bond_link) = handle.find_link(&config.name).await? {
        let bond = BondDevice::from_link(logger, &bond_link);
        let slaves = handle.resolve_links(&config.links, true).await?;

        bond.set_down(&handle).await?;
        detach_slaves(logger, &handle, &slaves).await?;

        // fail-over policy 0 leaves the bond's address on freed slaves,
        // so deduplication runs over their re-read state
        let mut freed = Vec::with_capacity(slaves.len());
        for slave in &slaves {
            if let Some(link) = handle.find_link(&slave.name()).await? {
                freed.push(link);
            }
        }
        for rewrite in plan_mac_rewrites(&freed)? {
            info!(
                logger,
                "reassigning duplicated hardware address on freed {}", rewrite.name
            );
            handle
                .set_hardware_addr(rewrite.index, &rewrite.name, &rewrite.addr)
                .await?;
        }

        bond.delete(&handle).await?;
    } else {
        info!(logger, "bond {} already absent", config.name);
    }

    if !config.links_in_container {
        let host_ns = Netns::current()?;
        migrate_to_host(logger, &handle, &config.links, &host_ns).await?;
    }
    Ok(())
}

/// Moves the named links from the invoking namespace into the container
/// namespace. Everything is resolved up front so a missing name fails
/// the migration before any link has moved.
async fn migrate_to_container(
    logger: &Logger,
    host_handle: &Handle,
    names: &[String],
    target: &Netns,
) -> Result<()> {
    let links = host_handle.resolve_links(names, false).await?;
    for link in &links {
        host_handle
            .move_link(link, target)
            .await
            .with_context(|| format!("move {} into {}", link.name(), target.path()))?;
    }
    info!(logger, "moved {} links into {}", links.len(), target.path());
    Ok(())
}

/// Returns previously migrated links to the invoking namespace. Links
/// that no longer exist are skipped; teardown never fails over state
/// that is already gone.
async fn migrate_to_host(
    logger: &Logger,
    handle: &Handle,
    names: &[String],
    host_ns: &Netns,
) -> Result<()> {
    for name in names {
        match handle.find_link(name).await? {
            Some(link) => {
                handle
                    .move_link(&link, host_ns)
                    .await
                    .with_context(|| format!("move {} back to {}", name, host_ns.path()))?;
            }
            None => {
                warn!(logger, "link {} not present for restore, skipping", name);
            }
        }
    }
    Ok(())
}
