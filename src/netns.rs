// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::Result;
use nix::sched::{setns, CloneFlags};
use nix::unistd::{getpid, gettid};
use slog::Logger;

use crate::error::BondError;

/// Path of the network namespace the calling thread currently runs in.
pub fn current_thread_ns_path() -> String {
    format!("/proc/{}/task/{}/ns/net", getpid(), gettid())
}

/// An open handle to a network namespace. Holding the file keeps the
/// namespace alive even if its last process exits.
#[derive(Debug)]
pub struct Netns {
    file: File,
    path: String,
}

impl Netns {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(path).map_err(|e| BondError::Namespace {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    /// The namespace of the calling thread.
    pub fn current() -> Result<Self> {
        Self::open(&current_thread_ns_path())
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Moves the calling thread into a namespace and back out when dropped.
/// Entry and drop must happen on the same OS thread; the engine pins its
/// workflows to a dedicated thread for exactly this reason.
pub(crate) struct NetnsGuard {
    logger: Logger,
    old_netns: File,
}

impl NetnsGuard {
    pub(crate) fn enter(logger: &Logger, netns: &Netns) -> Result<Self> {
        let current_path = current_thread_ns_path();
        let old_netns = File::open(&current_path).map_err(|e| BondError::Namespace {
            path: current_path.clone(),
            reason: e.to_string(),
        })?;
        setns(netns.fd(), CloneFlags::CLONE_NEWNET).map_err(|e| BondError::Namespace {
            path: netns.path().to_string(),
            reason: format!("setns: {}", e),
        })?;
        debug!(
            logger,
            "entered netns {} on tid {}",
            netns.path(),
            gettid().to_string()
        );
        Ok(Self {
            logger: logger.clone(),
            old_netns,
        })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        setns(self.old_netns.as_raw_fd(), CloneFlags::CLONE_NEWNET).unwrap();
        debug!(self.logger, "restored previous netns");
    }
}
