/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The opaque tensor buffer moved by the rendezvous. The core never
//! interprets payloads: it tags them with a dtype and shape, copies
//! them between devices, and passes them through transports. Payloads
//! are [`bytes::Bytes`], so a same-worker copy is a refcount bump.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::worker::DeviceName;

/// The element type tag carried alongside a tensor payload. The core
/// does not validate payload length against the tag; kernels own that.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float elements.
    Float32,
    /// 64-bit IEEE float elements.
    Float64,
    /// 32-bit signed integer elements.
    Int32,
    /// 64-bit signed integer elements.
    Int64,
    /// Boolean elements, one byte each.
    Bool,
    /// Raw bytes with no element structure.
    Raw,
}

/// An opaque, immutable tensor buffer: dtype tag, shape, and payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TensorValue {
    dtype: DType,
    shape: Vec<u64>,
    data: Bytes,
}

impl TensorValue {
    /// Create a tensor value from its parts.
    pub fn new(dtype: DType, shape: Vec<u64>, data: impl Into<Bytes>) -> Self {
        Self {
            dtype,
            shape,
            data: data.into(),
        }
    }

    /// A scalar (rank-0) value over the given raw element bytes.
    pub fn scalar(dtype: DType, data: impl Into<Bytes>) -> Self {
        Self::new(dtype, Vec::new(), data)
    }

    /// The element type tag.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The tensor's shape.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The raw payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Per-operation context carried with a send or a receive: the device
/// the tensor is produced on or destined for. Args travel with the
/// transfer and are handed back to the receiver so it can see both
/// sides' context.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TransferArgs {
    /// The device this side of the transfer runs on, when known.
    pub device: Option<DeviceName>,
}

impl TransferArgs {
    /// Args for an operation running on the given device.
    pub fn on_device(device: DeviceName) -> Self {
        Self {
            device: Some(device),
        }
    }
}

/// One buffered transfer: the value, the producer's deadness flag, and
/// the producer's args. A dead tensor marks an untaken control-flow
/// branch; it propagates through transfers like a live one.
#[derive(Debug, Clone)]
pub struct TensorItem {
    /// The transferred value.
    pub value: TensorValue,
    /// Whether the producer marked the value dead.
    pub is_dead: bool,
    /// The producer's transfer args.
    pub args: TransferArgs,
}
