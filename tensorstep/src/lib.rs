/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tensorstep is the tensor hand-off layer of a distributed graph
//! execution engine: step-scoped rendezvous channels matching one
//! tensor producer to one consumer by key, across devices and across
//! workers.
//!
//! # Data model
//!
//! Every transfer is named by a [`key::RendezvousKey`]: the producer
//! device (and its incarnation), the consumer device, a tensor name,
//! and a frame/iteration coordinate. Both ends compute the identical
//! canonical key string, so out-of-order arrival resolves without
//! coordination: whichever side arrives first leaves its half in the
//! step's table, and the other side completes the match.
//!
//! Transfers are scoped to a _step_ — one logical execution of a
//! registered graph, identified by a caller-chosen `step_id` and
//! isolated from every other step. The
//! [`mgr::RendezvousManager`] owns the `step_id` →
//! [`remote::WorkerRendezvous`] registry for one worker process.
//!
//! | Entity              | Keyed by                              |
//! |---------------------|---------------------------------------|
//! | Transfer            | `src_device;incarnation;dst;name;f:i` |
//! | Step rendezvous     | `step_id`                             |
//! | Worker route        | worker name                           |
//!
//! # Lifecycle
//!
//! A step rendezvous is created lazily on first lookup and accepts
//! sends immediately; receives wait for
//! [`remote::WorkerRendezvous::initialize`] to supply the
//! [`worker::WorkerSession`] that resolves device names, and are
//! replayed in arrival order once it does. Aborting a rendezvous is
//! first-status-wins and fans out to every pending and future
//! operation on it.

#![deny(missing_docs)]

pub mod config;
pub mod key;
pub mod mgr;
pub mod remote;
pub mod rendezvous;
pub mod tensor;
pub mod transport;
pub mod worker;

pub use config::Config;
pub use key::FrameIter;
pub use key::RendezvousKey;
pub use mgr::RendezvousManager;
pub use remote::RecvRequest;
pub use remote::RecvResponse;
pub use remote::Transport;
pub use remote::WorkerRendezvous;
pub use rendezvous::LocalRendezvous;
pub use rendezvous::RecvFuture;
pub use rendezvous::RecvOk;
pub use rendezvous::TransferError;
pub use tensor::DType;
pub use tensor::TensorItem;
pub use tensor::TensorValue;
pub use tensor::TransferArgs;
pub use transport::InProcessTransport;
pub use transport::TransportRouter;
pub use worker::DeviceKind;
pub use worker::DeviceName;
pub use worker::DeviceSet;
pub use worker::WorkerSession;
