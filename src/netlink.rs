// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{Context, Result};
use futures::stream::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkMessage, VfInfo};
use rtnetlink::LinkUnspec;
use slog::Logger;
use tokio::task::JoinHandle;

use crate::error::BondError;
use crate::netns::{Netns, NetnsGuard};

/// Snapshot of one kernel link, taken at lookup time.
#[derive(Clone, Debug)]
pub struct Link(LinkMessage);

impl From<LinkMessage> for Link {
    fn from(message: LinkMessage) -> Self {
        Self(message)
    }
}

impl Link {
    pub fn index(&self) -> u32 {
        self.0.header.index
    }

    pub fn name(&self) -> String {
        for attr in &self.0.attributes {
            if let LinkAttribute::IfName(name) = attr {
                return name.clone();
            }
        }
        String::new()
    }

    pub fn mtu(&self) -> Option<u32> {
        for attr in &self.0.attributes {
            if let LinkAttribute::Mtu(mtu) = attr {
                return Some(*mtu);
            }
        }
        None
    }

    pub fn hardware_addr(&self) -> Option<Vec<u8>> {
        for attr in &self.0.attributes {
            if let LinkAttribute::Address(addr) = attr {
                return Some(addr.clone());
            }
        }
        None
    }

    /// Index of the controlling (master) device, if enslaved.
    pub fn controller(&self) -> Option<u32> {
        for attr in &self.0.attributes {
            if let LinkAttribute::Controller(index) = attr {
                return Some(*index);
            }
        }
        None
    }

    /// Hardware addresses of the virtual functions exposed by this link,
    /// for links backed by an SR-IOV physical function. Empty for
    /// everything else.
    pub fn vf_addresses(&self) -> Vec<[u8; 6]> {
        let mut addrs = Vec::new();
        for attr in &self.0.attributes {
            if let LinkAttribute::VfInfoList(vf_list) = attr {
                for vf in vf_list {
                    for info in &vf.0 {
                        if let VfInfo::Mac(mac) = info {
                            if mac.mac.len() >= 6 {
                                let mut addr = [0u8; 6];
                                addr.copy_from_slice(&mac.mac[..6]);
                                addrs.push(addr);
                            }
                        }
                    }
                }
            }
        }
        addrs
    }
}

/// Async route-netlink handle. The underlying socket stays bound to the
/// namespace that was current when it was opened, so requests issued
/// here keep acting on that namespace even after the opening thread has
/// switched away.
pub struct Handle {
    handle: rtnetlink::Handle,
    connection: JoinHandle<()>,
    logger: Logger,
}

impl Handle {
    /// Opens a handle in the invoking namespace.
    pub fn new(logger: &Logger) -> Result<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("new netlink connection")?;
        let connection = tokio::spawn(connection);
        Ok(Self {
            handle,
            connection,
            logger: logger.new(o!("subsystem" => "netlink")),
        })
    }

    /// Opens a handle bound to the given namespace. The calling thread
    /// enters the namespace only for the duration of socket creation.
    pub fn new_in_netns(logger: &Logger, netns: &Netns) -> Result<Self> {
        let _guard = NetnsGuard::enter(logger, netns)?;
        Self::new(logger)
    }

    pub(crate) fn raw(&self) -> &rtnetlink::Handle {
        &self.handle
    }

    pub async fn get_link(&self, name: &str) -> Result<Link> {
        self.find_link(name)
            .await?
            .ok_or_else(|| BondError::LinkNotFound(name.to_string()).into())
    }

    /// Looks a link up by name, mapping "no such device" to None.
    pub async fn find_link(&self, name: &str) -> Result<Option<Link>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(message)) => Ok(Some(message.into())),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(err)) if err.raw_code() == -libc::ENODEV => {
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("get link {}", name)),
        }
    }

    pub async fn list_links(&self) -> Result<Vec<Link>> {
        let mut out = Vec::new();
        let mut links = self.handle.link().get().execute();
        while let Some(message) = links.try_next().await.context("dump links")? {
            out.push(message.into());
        }
        Ok(out)
    }

    /// Resolves the named links in input order. Fewer than two names can
    /// never form a bond and fails outright. With `tolerate_missing`,
    /// absent links are skipped instead of failing the resolution.
    pub async fn resolve_links(&self, names: &[String], tolerate_missing: bool) -> Result<Vec<Link>> {
        if names.len() < 2 {
            return Err(BondError::InsufficientLinks(names.len()).into());
        }
        let mut links = Vec::with_capacity(names.len());
        for name in names {
            match self.find_link(name).await? {
                Some(link) => links.push(link),
                None if tolerate_missing => {
                    warn!(self.logger, "link {} already gone, skipping", name);
                }
                None => return Err(BondError::LinkNotFound(name.clone()).into()),
            }
        }
        Ok(links)
    }

    pub async fn set_link_up(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| device_err(name, format!("set up: {}", e)))
    }

    pub async fn set_link_down(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).down().build())
            .execute()
            .await
            .map_err(|e| device_err(name, format!("set down: {}", e)))
    }

    pub async fn set_controller(&self, index: u32, name: &str, controller: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).controller(controller).build())
            .execute()
            .await
            .map_err(|e| device_err(name, format!("set controller {}: {}", controller, e)))
    }

    pub async fn clear_controller(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).nocontroller().build())
            .execute()
            .await
            .map_err(|e| device_err(name, format!("clear controller: {}", e)))
    }

    pub async fn set_hardware_addr(&self, index: u32, name: &str, addr: &[u8; 6]) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).address(addr.to_vec()).build())
            .execute()
            .await
            .map_err(|e| device_err(name, format!("set hardware address: {}", e)))
    }

    /// Relocates a link into another namespace. The link is downed
    /// first; the kernel resets its state on the way over and the new
    /// namespace decides when to bring it back up.
    pub async fn move_link(&self, link: &Link, target: &Netns) -> Result<()> {
        let name = link.name();
        self.set_link_down(link.index(), &name).await?;
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(link.index())
                    .setns_by_fd(target.fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| device_err(&name, format!("move to {}: {}", target.path(), e)))?;
        info!(self.logger, "moved link {} to {}", name, target.path());
        Ok(())
    }

    /// Deletes a link. A link that is already gone counts as deleted.
    pub async fn del_link(&self, index: u32, name: &str) -> Result<()> {
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(err)) if err.raw_code() == -libc::ENODEV => {
                warn!(self.logger, "link {} already deleted", name);
                Ok(())
            }
            Err(e) => Err(device_err(name, format!("delete: {}", e))),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

fn device_err(name: &str, reason: String) -> anyhow::Error {
    BondError::Device {
        device: name.to_string(),
        reason,
    }
    .into()
}

#[cfg(test)]
pub(crate) fn test_link(index: u32, name: &str, mtu: u32, addr: &[u8]) -> Link {
    let mut message = LinkMessage::default();
    message.header.index = index;
    message
        .attributes
        .push(LinkAttribute::IfName(name.to_string()));
    message.attributes.push(LinkAttribute::Mtu(mtu));
    if !addr.is_empty() {
        message.attributes.push(LinkAttribute::Address(addr.to_vec()));
    }
    Link::from(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    #[test]
    fn test_link_accessors() {
        let link = test_link(7, "net1", 1500, &[0x02, 0, 0, 0, 0, 1]);
        assert_eq!(link.index(), 7);
        assert_eq!(link.name(), "net1");
        assert_eq!(link.mtu(), Some(1500));
        assert_eq!(link.hardware_addr(), Some(vec![0x02, 0, 0, 0, 0, 1]));
        assert_eq!(link.controller(), None);
        assert!(link.vf_addresses().is_empty());
    }

    #[test]
    fn test_link_without_attributes() {
        let link = Link::from(LinkMessage::default());
        assert_eq!(link.name(), "");
        assert_eq!(link.mtu(), None);
        assert_eq!(link.hardware_addr(), None);
    }

    #[tokio::test]
    async fn test_find_link_loopback() {
        let handle = Handle::new(&test_logger()).unwrap();
        let lo = handle.find_link("lo").await.unwrap();
        assert!(lo.is_some());
        assert_eq!(lo.unwrap().name(), "lo");

        let missing = handle.find_link("no-such-device-0").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_resolve_links_requires_two_names() {
        let handle = Handle::new(&test_logger()).unwrap();
        let err = handle
            .resolve_links(&["lo".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BondError>(),
            Some(BondError::InsufficientLinks(1))
        ));
    }

    #[tokio::test]
    async fn test_resolve_links_missing_link() {
        let handle = Handle::new(&test_logger()).unwrap();
        let names = vec!["lo".to_string(), "no-such-device-0".to_string()];

        let err = handle.resolve_links(&names, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BondError>(),
            Some(BondError::LinkNotFound(_))
        ));

        // teardown tolerates the hole and keeps the order of the rest
        let links = handle.resolve_links(&names, true).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name(), "lo");
    }
}
