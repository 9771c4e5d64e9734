// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

pub mod bond;
pub mod config;
pub mod engine;
pub mod error;
pub mod mac;
pub mod mtu;
pub mod netlink;
pub mod netns;

pub use config::{BondConfig, BondMode};
pub use engine::{Engine, Interface};
pub use error::BondError;

#[cfg(test)]
#[macro_export]
macro_rules! skip_if_not_root {
    () => {
        if !nix::unistd::Uid::effective().is_root() {
            println!("INFO: skipping {} which needs root", module_path!());
            return;
        }
    };
}
