// Copyright (c) 2024 The bond-cni authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

/// Failure classes of the bonding workflows. Orchestration code wraps
/// these in `anyhow::Error` with call-site context; callers that need to
/// branch on the class downcast back to this type.
#[derive(Error, Debug)]
pub enum BondError {
    #[error("invalid bonding configuration: {0}")]
    Config(String),

    #[error("bonding requires at least two links, have {0}")]
    InsufficientLinks(usize),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("network namespace {path}: {reason}")]
    Namespace { path: String, reason: String },

    #[error("invalid bond MTU {mtu}: {reason}")]
    Mtu { mtu: u32, reason: String },

    #[error("failOverMac must be 0, 1 or 2, have {0}")]
    FailOverMacRange(u8),

    #[error("device {device}: {reason}")]
    Device { device: String, reason: String },

    #[error("failed to generate a hardware address: {0}")]
    MacGeneration(String),
}
