/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The worker and device model: structured device names, the set of
//! devices owned by a worker, and the [`WorkerSession`] context used
//! to resolve them.
//!
//! Device names have a canonical string form, `worker/device:KIND:index`,
//! that round-trips through [`std::fmt::Display`] and [`std::str::FromStr`]:
//!
//! ```
//! # use tensorstep::worker::DeviceName;
//! let device: DeviceName = "trainer0/device:CPU:0".parse().unwrap();
//! assert_eq!(device.to_string(), "trainer0/device:CPU:0");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// The type of error encountered while parsing device names.
#[derive(thiserror::Error, Debug)]
pub enum DeviceParsingError {
    /// The name did not have the `worker/device:KIND:index` shape.
    #[error("invalid device name: {0}")]
    Invalid(String),

    /// The worker component was empty or contained a reserved character.
    #[error("invalid worker name: {0}")]
    InvalidWorker(String),

    /// The device kind component was empty or contained a reserved
    /// character.
    #[error("invalid device kind: {0}")]
    InvalidKind(String),

    /// The device index was not a valid integer.
    #[error(transparent)]
    ParseInt(#[from] ParseIntError),
}

fn is_valid_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// The kind of a device. Kinds beyond CPU and GPU are carried verbatim
/// so that the core does not need to enumerate every accelerator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    /// A host CPU device.
    Cpu,
    /// A GPU device.
    Gpu,
    /// Any other accelerator, named by its registered kind string.
    Other(String),
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu => write!(f, "GPU"),
            DeviceKind::Other(kind) => write!(f, "{}", kind),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = DeviceParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CPU" => Ok(DeviceKind::Cpu),
            "GPU" => Ok(DeviceKind::Gpu),
            other if is_valid_component(other) => Ok(DeviceKind::Other(other.to_string())),
            other => Err(DeviceParsingError::InvalidKind(other.to_string())),
        }
    }
}

/// A fully qualified device name: the worker that owns the device, the
/// device kind, and the index of the device within its kind.
///
/// Device names are immutable values; they are hashable and ordered so
/// they can key tables, and serializable so they can traverse process
/// boundaries inside rendezvous keys.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceName {
    worker: String,
    kind: DeviceKind,
    index: u32,
}

impl DeviceName {
    /// Create a new device name. The worker component must be non-empty
    /// and restricted to `[A-Za-z0-9_.-]`.
    pub fn new(
        worker: impl Into<String>,
        kind: DeviceKind,
        index: u32,
    ) -> Result<Self, DeviceParsingError> {
        let worker = worker.into();
        if !is_valid_component(&worker) {
            return Err(DeviceParsingError::InvalidWorker(worker));
        }
        Ok(Self {
            worker,
            kind,
            index,
        })
    }

    /// The name of the worker owning this device.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// The device's kind.
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// The device's index within its kind.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/device:{}:{}", self.worker, self.kind, self.index)
    }
}

impl FromStr for DeviceName {
    type Err = DeviceParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (worker, rest) = s
            .split_once('/')
            .ok_or_else(|| DeviceParsingError::Invalid(s.to_string()))?;
        let mut parts = rest.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("device"), Some(kind), Some(index)) => Self::new(
                worker,
                kind.parse()?,
                index.parse()?,
            ),
            _ => Err(DeviceParsingError::Invalid(s.to_string())),
        }
    }
}

/// The set of devices owned by one worker, each tagged with an
/// incarnation number minted when the device was added. Incarnations
/// distinguish a device from a previous life of the same name after a
/// worker restart: rendezvous keys embed the producer's incarnation, and
/// a stale key fails fast instead of matching the reborn device.
#[derive(Debug, Clone, Default)]
pub struct DeviceSet {
    devices: HashMap<DeviceName, u64>,
}

impl DeviceSet {
    /// Create an empty device set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, minting a fresh nonzero incarnation for it. Returns
    /// the incarnation. Re-adding an existing device re-incarnates it.
    pub fn insert(&mut self, device: DeviceName) -> u64 {
        let incarnation = loop {
            let candidate: u64 = rand::thread_rng().r#gen();
            if candidate != 0 {
                break candidate;
            }
        };
        self.devices.insert(device, incarnation);
        incarnation
    }

    /// Whether the set contains the given device.
    pub fn contains(&self, device: &DeviceName) -> bool {
        self.devices.contains_key(device)
    }

    /// The incarnation of the given device, if present.
    pub fn incarnation(&self, device: &DeviceName) -> Option<u64> {
        self.devices.get(device).copied()
    }

    /// Iterate over the devices in the set.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceName, u64)> {
        self.devices.iter().map(|(name, inc)| (name, *inc))
    }

    /// The number of devices in the set.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// The per-worker execution context: the worker's name and the devices
/// it owns. Sessions are externally supplied and read-only here; the
/// rendezvous core resolves device names against them and never mutates
/// them.
#[derive(Debug)]
pub struct WorkerSession {
    worker_name: String,
    devices: DeviceSet,
}

impl WorkerSession {
    /// Create a session for the named worker owning the given devices.
    pub fn new(worker_name: impl Into<String>, devices: DeviceSet) -> Self {
        Self {
            worker_name: worker_name.into(),
            devices,
        }
    }

    /// Convenience constructor: a session owning `num_cpus` CPU devices
    /// (`worker/device:CPU:0` through `CPU:{num_cpus - 1}`). Panics on
    /// an invalid worker name.
    pub fn with_cpus(worker_name: impl Into<String>, num_cpus: u32) -> Self {
        let worker_name = worker_name.into();
        let mut devices = DeviceSet::new();
        for index in 0..num_cpus {
            let device = DeviceName::new(worker_name.clone(), DeviceKind::Cpu, index)
                .unwrap_or_else(|err| panic!("invalid worker name: {}", err));
            devices.insert(device);
        }
        Self {
            worker_name,
            devices,
        }
    }

    /// The name of this worker.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// The devices owned by this worker.
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// Whether the given device is owned by this worker: the worker
    /// component must match and the device must be in the set.
    pub fn owns_device(&self, device: &DeviceName) -> bool {
        device.worker() == self.worker_name && self.devices.contains(device)
    }

    /// The device used to stand in for the step's client when feeding
    /// inputs and draining outputs: the worker's `CPU:0` device.
    pub fn client_device(&self) -> Option<DeviceName> {
        let device = DeviceName::new(self.worker_name.clone(), DeviceKind::Cpu, 0).ok()?;
        self.devices.contains(&device).then_some(device)
    }
}
