/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Rendezvous keys name one logical tensor transfer between a producer
//! and a consumer device. Both ends compute the identical canonical
//! string, so the encoding must be deterministic and stable across
//! processes:
//!
//! ```text
//! src_device;src_incarnation(hex);dst_device;tensor_name;frame:iter
//! ```
//!
//! Keys are immutable once created; two sends/recvs with equal keys
//! refer to the same logical transfer.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::worker::DeviceName;
use crate::worker::DeviceParsingError;

/// The type of error encountered while building or parsing rendezvous
/// keys.
#[derive(thiserror::Error, Debug)]
pub enum KeyParsingError {
    /// The encoding did not have five `;`-separated components.
    #[error("invalid key encoding: {0}")]
    Invalid(String),

    /// The tensor name was empty or contained the `;` separator.
    #[error("invalid tensor name: {0:?}")]
    InvalidName(String),

    /// A device component failed to parse.
    #[error(transparent)]
    Device(#[from] DeviceParsingError),

    /// The incarnation or frame component was not a valid integer.
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
}

/// The frame/iteration coordinate of a transfer, distinguishing
/// occurrences of the same tensor name across control-flow frames and
/// loop iterations.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct FrameIter {
    /// The control-flow frame id.
    pub frame_id: u64,
    /// The iteration within the frame.
    pub iter_id: u64,
}

impl FrameIter {
    /// The root frame, iteration zero. Transfers outside any
    /// control-flow construct use this coordinate.
    pub const ROOT: FrameIter = FrameIter {
        frame_id: 0,
        iter_id: 0,
    };
}

impl fmt::Display for FrameIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.frame_id, self.iter_id)
    }
}

/// A parsed rendezvous key: the producer device and its incarnation, the
/// consumer device, the tensor name, and the frame/iteration coordinate.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RendezvousKey {
    src_device: DeviceName,
    src_incarnation: u64,
    dst_device: DeviceName,
    name: String,
    frame_iter: FrameIter,
}

impl RendezvousKey {
    /// Create a key for the transfer of `name` from `src_device` (at the
    /// given incarnation) to `dst_device` at `frame_iter`. Fails if the
    /// tensor name is empty or contains the `;` separator.
    pub fn new(
        src_device: DeviceName,
        src_incarnation: u64,
        dst_device: DeviceName,
        name: impl Into<String>,
        frame_iter: FrameIter,
    ) -> Result<Self, KeyParsingError> {
        let name = name.into();
        if name.is_empty() || name.contains(';') {
            return Err(KeyParsingError::InvalidName(name));
        }
        Ok(Self {
            src_device,
            src_incarnation,
            dst_device,
            name,
            frame_iter,
        })
    }

    /// The producer's device.
    pub fn src_device(&self) -> &DeviceName {
        &self.src_device
    }

    /// The producer device's incarnation at key creation time.
    pub fn src_incarnation(&self) -> u64 {
        self.src_incarnation
    }

    /// The consumer's device.
    pub fn dst_device(&self) -> &DeviceName {
        &self.dst_device
    }

    /// The transferred tensor's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The frame/iteration coordinate of the transfer.
    pub fn frame_iter(&self) -> FrameIter {
        self.frame_iter
    }
}

impl fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{:x};{};{};{}",
            self.src_device, self.src_incarnation, self.dst_device, self.name, self.frame_iter
        )
    }
}

impl FromStr for RendezvousKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(';').collect();
        let [src, incarnation, dst, name, frame_iter] = parts.as_slice() else {
            return Err(KeyParsingError::Invalid(s.to_string()));
        };
        let (frame_id, iter_id) = frame_iter
            .split_once(':')
            .ok_or_else(|| KeyParsingError::Invalid(s.to_string()))?;
        Self::new(
            src.parse()?,
            u64::from_str_radix(incarnation, 16)?,
            dst.parse()?,
            *name,
            FrameIter {
                frame_id: frame_id.parse()?,
                iter_id: iter_id.parse()?,
            },
        )
    }
}
