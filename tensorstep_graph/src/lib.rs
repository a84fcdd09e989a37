/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Graph registration and step execution on top of the `tensorstep`
//! rendezvous layer.
//!
//! A worker registers a partitioned [`GraphDef`] once with
//! [`GraphMgr::register`] and then executes it repeatedly: each call
//! to [`GraphMgr::execute`] is one _step_, isolated from every other
//! step by its `step_id`. Within a step, the graph's partitions run
//! concurrently — one executor per device — and exchange tensors
//! through the step's rendezvous, which also carries the step's inputs
//! in and its outputs back out:
//!
//! ```text
//! register(gdef) ─► handle
//! execute(handle, step_id, inputs) ─► partitions run, crossing
//!     devices and workers through the step rendezvous
//! recv_outputs(handle, step_id, names) ─► named outputs
//! ```
//!
//! Failures never dangle a step: the first partition error aborts the
//! step's rendezvous (failing every pending transfer), cancels the
//! remaining partitions, and resolves the step with that error.

#![deny(missing_docs)]

pub mod executor;
pub mod graph;
pub mod mgr;

pub use executor::KernelRegistry;
pub use executor::OpContext;
pub use executor::OpKernel;
pub use graph::AttrValue;
pub use graph::GraphDef;
pub use graph::GraphError;
pub use graph::NodeDef;
pub use graph::OP_ARG;
pub use graph::OP_RECV;
pub use graph::OP_RETVAL;
pub use graph::OP_SEND;
pub use mgr::ExecuteOptions;
pub use mgr::GraphMgr;
pub use mgr::StepHandle;
