/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The graph manager: registers partitioned graphs under opaque
//! handles and drives their execution, one step at a time, with the
//! step's rendezvous as the data bus.
//!
//! A step is independent of other steps sharing the same handle; the
//! same graph may execute concurrently under different step ids. Any
//! partition failure aborts the step's rendezvous (unblocking peers
//! stuck in receives), cancels the remaining partitions, and surfaces
//! the first error through the step's completion.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use tensorstep::config::Config;
use tensorstep::mgr::RendezvousManager;
use tensorstep::remote::WorkerRendezvous;
use tensorstep::rendezvous::TransferError;
use tensorstep::tensor::TensorValue;
use tensorstep::tensor::TransferArgs;
use tensorstep::worker::DeviceName;
use tensorstep::worker::WorkerSession;

use crate::executor::run_partition;
use crate::executor::KernelRegistry;
use crate::graph::plan;
use crate::graph::transfer_key;
use crate::graph::GraphDef;
use crate::graph::GraphError;
use crate::graph::GraphPlan;
use crate::graph::NodeKind;
use crate::graph::PartitionPlan;

/// Per-step execution options.
#[derive(Debug, Default)]
pub struct ExecuteOptions {
    /// The step's cancellation token. Cancelling it cooperatively
    /// stops in-flight partitions; there is no automatic timeout.
    pub cancellation: CancellationToken,
}

/// One registered graph: its partition plans plus the input/output
/// wiring. In-flight steps hold their own reference, so deregistering
/// a handle defers destruction until they complete.
#[derive(Debug)]
struct Item {
    handle: String,
    partitions: Vec<Arc<PartitionPlan>>,
    args: HashMap<String, DeviceName>,
    rets: HashMap<String, (DeviceName, u64)>,
    client: Option<(DeviceName, u64)>,
}

/// The completion of one step. Resolves with the step's outcome once
/// every partition has finished (the first error wins).
#[derive(Debug)]
pub struct StepHandle {
    rx: oneshot::Receiver<Result<(), GraphError>>,
}

impl StepHandle {
    fn ready(result: Result<(), GraphError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for StepHandle {
    type Output = Result<(), GraphError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|completed| match completed {
            Ok(result) => result,
            Err(_) => Err(GraphError::ExecutorFailed("step driver dropped".to_string())),
        })
    }
}

/// The handle → graph registry and step driver for one worker.
#[derive(Debug)]
pub struct GraphMgr {
    session: Arc<WorkerSession>,
    rendezvous_mgr: Arc<RendezvousManager>,
    kernels: Arc<KernelRegistry>,
    items: DashMap<String, Arc<Item>>,
    config: Config,
}

impl GraphMgr {
    /// Create a manager for `session`, exchanging tensors through
    /// `rendezvous_mgr` and computing nodes with the kernels in
    /// `kernels`.
    pub fn new(
        session: Arc<WorkerSession>,
        rendezvous_mgr: Arc<RendezvousManager>,
        kernels: KernelRegistry,
    ) -> Self {
        Self::with_config(session, rendezvous_mgr, kernels, Config::default())
    }

    /// [`new`], with an explicit configuration.
    ///
    /// [`new`]: GraphMgr::new
    pub fn with_config(
        session: Arc<WorkerSession>,
        rendezvous_mgr: Arc<RendezvousManager>,
        kernels: KernelRegistry,
        config: Config,
    ) -> Self {
        Self {
            session,
            rendezvous_mgr,
            kernels: Arc::new(kernels),
            items: DashMap::new(),
            config,
        }
    }

    /// Validate and partition `gdef`, and store it under a freshly
    /// generated handle. Every non-structural op must have a
    /// registered kernel.
    pub fn register(&self, gdef: &GraphDef) -> Result<String, GraphError> {
        let GraphPlan {
            partitions,
            args,
            rets,
            client,
        } = plan(gdef, &self.session)?;
        for partition in &partitions {
            for node in &partition.nodes {
                if matches!(node.kind, NodeKind::Compute) && !self.kernels.contains(&node.def.op) {
                    return Err(GraphError::InvalidGraph(format!(
                        "no kernel registered for op {:?} (node {:?})",
                        node.def.op, node.def.name
                    )));
                }
            }
        }

        let handle = format!(
            "{}{:016x}",
            self.config.handle_prefix,
            rand::thread_rng().r#gen::<u64>()
        );
        tracing::info!(
            name = "graph_registered",
            handle = handle.as_str(),
            partitions = partitions.len(),
            nodes = gdef.nodes.len(),
            "registered graph"
        );
        self.items.insert(
            handle.clone(),
            Arc::new(Item {
                handle: handle.clone(),
                partitions: partitions.into_iter().map(Arc::new).collect(),
                args,
                rets,
                client,
            }),
        );
        Ok(handle)
    }

    /// Drop the manager's reference to `handle`. In-flight steps keep
    /// the graph alive until they complete.
    pub fn deregister(&self, handle: &str) -> Result<(), GraphError> {
        match self.items.remove(handle) {
            Some(_) => {
                tracing::info!(name = "graph_deregistered", handle, "deregistered graph");
                Ok(())
            }
            None => Err(GraphError::UnknownHandle(handle.to_string())),
        }
    }

    /// [`deregister`] every handle.
    ///
    /// [`deregister`]: GraphMgr::deregister
    pub fn deregister_all(&self) {
        self.items.clear();
    }

    /// The number of registered graphs. Diagnostic only.
    pub fn num_graphs(&self) -> usize {
        self.items.len()
    }

    /// Execute one step of `handle`: obtain the step's rendezvous,
    /// feed `inputs`, and launch every partition concurrently. The
    /// returned handle resolves once all partitions complete, with the
    /// first error if any failed. Does not block; errors detected
    /// before launch resolve the handle immediately.
    pub fn execute(
        &self,
        handle: &str,
        step_id: u64,
        options: ExecuteOptions,
        inputs: HashMap<String, TensorValue>,
    ) -> StepHandle {
        let item = match self.lookup(handle) {
            Ok(item) => item,
            Err(err) => return StepHandle::ready(Err(err)),
        };
        let rendezvous = self.rendezvous_mgr.find(step_id);
        if let Err(err) = rendezvous.ensure_initialized(&self.session) {
            return StepHandle::ready(Err(err.into()));
        }
        if let Err(err) = Self::send_inputs_into(&item, &rendezvous, inputs) {
            return StepHandle::ready(Err(err));
        }

        tracing::debug!(
            name = "step_started",
            handle = item.handle.as_str(),
            step_id,
            partitions = item.partitions.len(),
            "starting step"
        );
        let (tx, rx) = oneshot::channel();
        let registry = self.kernels.clone();
        let cancel = options.cancellation;
        tokio::spawn(async move {
            let mut partitions = JoinSet::new();
            for partition in &item.partitions {
                partitions.spawn(run_partition(
                    partition.clone(),
                    rendezvous.clone(),
                    registry.clone(),
                    cancel.clone(),
                ));
            }

            let mut first_err: Option<GraphError> = None;
            while let Some(joined) = partitions.join_next().await {
                let result = joined
                    .unwrap_or_else(|join_err| Err(GraphError::ExecutorFailed(join_err.to_string())));
                if let Err(err) = result {
                    if first_err.is_none() {
                        // First failure wins: unblock peers stuck in
                        // receives, then stop the rest cooperatively.
                        rendezvous.start_abort(TransferError::Aborted(err.to_string()));
                        cancel.cancel();
                        first_err = Some(err);
                    }
                }
            }

            match first_err {
                Some(err) => {
                    tracing::warn!(
                        name = "step_failed",
                        handle = item.handle.as_str(),
                        step_id,
                        error = %err,
                        "step failed"
                    );
                    let _ = tx.send(Err(err));
                }
                None => {
                    tracing::debug!(
                        name = "step_completed",
                        handle = item.handle.as_str(),
                        step_id,
                        "step completed"
                    );
                    let _ = tx.send(Ok(()));
                }
            }
        });
        StepHandle { rx }
    }

    /// Feed named input tensors into the step's rendezvous, keyed
    /// against the graph's `_Arg` nodes. Works before or concurrently
    /// with [`execute`] on the same step.
    ///
    /// [`execute`]: GraphMgr::execute
    pub fn send_inputs(
        &self,
        handle: &str,
        step_id: u64,
        inputs: HashMap<String, TensorValue>,
    ) -> Result<(), GraphError> {
        let item = self.lookup(handle)?;
        let rendezvous = self.rendezvous_mgr.find(step_id);
        Self::send_inputs_into(&item, &rendezvous, inputs)
    }

    /// Drain the named step outputs from the step's rendezvous, keyed
    /// against the graph's `_Retval` nodes. Resolves as the outputs
    /// are produced.
    pub async fn recv_outputs(
        &self,
        handle: &str,
        step_id: u64,
        names: &[&str],
    ) -> Result<HashMap<String, TensorValue>, GraphError> {
        let item = self.lookup(handle)?;
        let rendezvous = self.rendezvous_mgr.find(step_id);
        let mut outputs = HashMap::with_capacity(names.len());
        for &name in names {
            let pending = Self::recv_output(&item, &rendezvous, name)?;
            let received = pending.await?;
            if received.is_dead {
                return Err(GraphError::DeadOutput(name.to_string()));
            }
            outputs.insert(name.to_string(), received.value);
        }
        Ok(outputs)
    }

    /// Blocking variant of [`recv_outputs`]: parks the calling thread
    /// until every named output is available. Must not be called from
    /// a runtime worker thread.
    ///
    /// [`recv_outputs`]: GraphMgr::recv_outputs
    pub fn recv_outputs_sync(
        &self,
        handle: &str,
        step_id: u64,
        names: &[&str],
    ) -> Result<HashMap<String, TensorValue>, GraphError> {
        let item = self.lookup(handle)?;
        let rendezvous = self.rendezvous_mgr.find(step_id);
        let pending: Vec<_> = names
            .iter()
            .map(|&name| Self::recv_output(&item, &rendezvous, name).map(|f| (name, f)))
            .collect::<Result<_, _>>()?;
        let mut outputs = HashMap::with_capacity(names.len());
        for (name, future) in pending {
            let received = future.wait()?;
            if received.is_dead {
                return Err(GraphError::DeadOutput(name.to_string()));
            }
            outputs.insert(name.to_string(), received.value);
        }
        Ok(outputs)
    }

    fn lookup(&self, handle: &str) -> Result<Arc<Item>, GraphError> {
        self.items
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GraphError::UnknownHandle(handle.to_string()))
    }

    fn send_inputs_into(
        item: &Item,
        rendezvous: &WorkerRendezvous,
        inputs: HashMap<String, TensorValue>,
    ) -> Result<(), GraphError> {
        if inputs.is_empty() {
            return Ok(());
        }
        let (client, client_incarnation) = item.client.clone().ok_or_else(|| {
            GraphError::InvalidGraph(format!("graph {} takes no inputs", item.handle))
        })?;
        for (name, value) in inputs {
            let arg_device = item.args.get(&name).ok_or_else(|| {
                GraphError::Transfer(TransferError::NotFound(format!(
                    "input {:?} is not an argument of graph {}",
                    name, item.handle
                )))
            })?;
            let key = transfer_key(&client, client_incarnation, arg_device, &name)?;
            rendezvous.send(
                key,
                TransferArgs::on_device(client.clone()),
                value,
                false,
            )?;
        }
        Ok(())
    }

    fn recv_output(
        item: &Item,
        rendezvous: &WorkerRendezvous,
        name: &str,
    ) -> Result<tensorstep::rendezvous::RecvFuture, GraphError> {
        let (client, _) = item.client.clone().ok_or_else(|| {
            GraphError::InvalidGraph(format!("graph {} produces no outputs", item.handle))
        })?;
        let (ret_device, ret_incarnation) = item.rets.get(name).ok_or_else(|| {
            GraphError::Transfer(TransferError::NotFound(format!(
                "output {:?} is not a return value of graph {}",
                name, item.handle
            )))
        })?;
        let key = transfer_key(ret_device, *ret_incarnation, &client, name)?;
        Ok(rendezvous.recv(key, TransferArgs::on_device(client)))
    }
}
