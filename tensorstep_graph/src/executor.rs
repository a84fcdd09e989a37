/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partition execution.
//!
//! One executor runs per graph partition per step, on the tokio
//! runtime. Nodes run in an order consistent with the whole graph's
//! topological order; inputs produced on other devices arrive as
//! rendezvous receives, and values consumed elsewhere leave as
//! rendezvous sends. The executor cooperates with the step's
//! cancellation token between nodes and while waiting on receives.
//!
//! Kernels implement the [`OpKernel`] seam. The built-in set is
//! structural only — `Const` and `Identity` — since the core moves
//! tensors without interpreting them; embedders register real compute
//! kernels on their [`KernelRegistry`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tensorstep::remote::WorkerRendezvous;
use tensorstep::rendezvous::TransferError;
use tensorstep::tensor::TensorValue;
use tensorstep::tensor::TransferArgs;
use tensorstep::worker::DeviceName;

use crate::graph::transfer_key;
use crate::graph::GraphError;
use crate::graph::NodeDef;
use crate::graph::NodeKind;
use crate::graph::PartitionPlan;
use crate::graph::ValueRef;

/// The inputs and definition a kernel sees when computing one node.
#[derive(Debug)]
pub struct OpContext<'a> {
    /// The node being computed.
    pub node: &'a NodeDef,
    /// The node's input values, in input order. All inputs are live;
    /// dead inputs short-circuit the node before the kernel runs.
    pub inputs: &'a [TensorValue],
}

/// A node computation. Kernels never block the executor on anything
/// but their own compute; tensor traffic is the executor's job.
pub trait OpKernel: Send + Sync + Debug {
    /// The op name this kernel implements.
    fn op(&self) -> &'static str;

    /// Compute the node's value from its inputs.
    fn compute(&self, ctx: OpContext<'_>) -> anyhow::Result<TensorValue>;
}

/// Emits the node's `value` attribute.
#[derive(Debug)]
struct ConstKernel;

impl OpKernel for ConstKernel {
    fn op(&self) -> &'static str {
        "Const"
    }

    fn compute(&self, ctx: OpContext<'_>) -> anyhow::Result<TensorValue> {
        ctx.node
            .attr_tensor("value")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Const node {:?} has no value attribute", ctx.node.name))
    }
}

/// Passes its input through unchanged.
#[derive(Debug)]
struct IdentityKernel;

impl OpKernel for IdentityKernel {
    fn op(&self) -> &'static str {
        "Identity"
    }

    fn compute(&self, ctx: OpContext<'_>) -> anyhow::Result<TensorValue> {
        Ok(ctx.inputs[0].clone())
    }
}

/// The op-name → kernel table used by a [`GraphMgr`].
///
/// [`GraphMgr`]: crate::mgr::GraphMgr
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: HashMap<&'static str, Arc<dyn OpKernel>>,
}

impl KernelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the structural built-ins (`Const`,
    /// `Identity`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ConstKernel));
        registry.register(Arc::new(IdentityKernel));
        registry
    }

    /// Register (or replace) a kernel under its op name.
    pub fn register(&mut self, kernel: Arc<dyn OpKernel>) {
        self.kernels.insert(kernel.op(), kernel);
    }

    /// Whether a kernel is registered for `op`.
    pub fn contains(&self, op: &str) -> bool {
        self.kernels.contains_key(op)
    }

    /// The kernel registered for `op`, if any.
    pub fn get(&self, op: &str) -> Option<Arc<dyn OpKernel>> {
        self.kernels.get(op).cloned()
    }
}

/// One received or computed value, with its deadness.
type Value = (TensorValue, bool);

/// Run one partition of one step to completion. Returns once every
/// node has run, the step is cancelled, or a node fails.
pub(crate) async fn run_partition(
    plan: Arc<PartitionPlan>,
    rendezvous: WorkerRendezvous,
    registry: Arc<KernelRegistry>,
    cancel: CancellationToken,
) -> Result<(), GraphError> {
    let args = TransferArgs::on_device(plan.device.clone());
    let mut env: HashMap<String, Value> = HashMap::new();

    for node in &plan.nodes {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled(format!(
                "step cancelled before node {:?}",
                node.def.name
            ))
            .into());
        }

        let mut inputs: Vec<Value> = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let value = match input {
                ValueRef::Local(name) => env
                    .get(name)
                    .expect("topological order guarantees local inputs")
                    .clone(),
                ValueRef::Transfer {
                    src,
                    src_incarnation,
                    name,
                } => {
                    // One receive per producer per partition per step;
                    // later consumers reuse the cached value.
                    match env.get(name) {
                        Some(value) => value.clone(),
                        None => {
                            let value =
                                recv(&rendezvous, src, *src_incarnation, &plan.device, name, &args, &cancel)
                                    .await?;
                            env.insert(name.clone(), value.clone());
                            value
                        }
                    }
                }
            };
            inputs.push(value);
        }

        let output: Option<Value> = match &node.kind {
            NodeKind::Arg {
                client,
                client_incarnation,
            } => Some(
                recv(
                    &rendezvous,
                    client,
                    *client_incarnation,
                    &plan.device,
                    &node.def.name,
                    &args,
                    &cancel,
                )
                .await?,
            ),
            NodeKind::Recv {
                src,
                src_incarnation,
            } => Some(
                recv(
                    &rendezvous,
                    src,
                    *src_incarnation,
                    &plan.device,
                    &node.def.name,
                    &args,
                    &cancel,
                )
                .await?,
            ),
            NodeKind::Ret { client } => {
                let (value, is_dead) = inputs.pop().expect("_Retval arity validated");
                let key = transfer_key(&plan.device, plan.incarnation, client, &node.def.name)?;
                rendezvous.send(key, args.clone(), value, is_dead)?;
                None
            }
            NodeKind::Send { dst } => {
                let (value, is_dead) = inputs.pop().expect("_Send arity validated");
                let key = transfer_key(&plan.device, plan.incarnation, dst, &node.def.name)?;
                rendezvous.send(key, args.clone(), value, is_dead)?;
                None
            }
            NodeKind::Compute => Some(compute(node.def.clone(), inputs, &registry).await?),
        };

        if let Some(output) = output {
            for consumer in &node.remote_consumers {
                let key = transfer_key(&plan.device, plan.incarnation, consumer, &node.def.name)?;
                rendezvous.send(key, args.clone(), output.0.clone(), output.1)?;
            }
            env.insert(node.def.name.clone(), output);
        }
    }

    tracing::trace!(
        name = "partition_done",
        device = %plan.device,
        nodes = plan.nodes.len(),
        "partition completed"
    );
    Ok(())
}

/// Receive one transfer, cooperating with cancellation.
async fn recv(
    rendezvous: &WorkerRendezvous,
    src: &DeviceName,
    src_incarnation: u64,
    dst: &DeviceName,
    name: &str,
    args: &TransferArgs,
    cancel: &CancellationToken,
) -> Result<Value, GraphError> {
    let key = transfer_key(src, src_incarnation, dst, name)?;
    let received = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(TransferError::Cancelled(format!(
                "step cancelled while waiting for {:?}",
                name
            ))
            .into());
        }
        received = rendezvous.recv(key, args.clone()) => received?,
    };
    Ok((received.value, received.is_dead))
}

/// Run one node's kernel. Dead inputs short-circuit: the node emits
/// the first dead input, dead, without invoking the kernel.
async fn compute(
    def: NodeDef,
    inputs: Vec<Value>,
    registry: &Arc<KernelRegistry>,
) -> Result<Value, GraphError> {
    if let Some((value, _)) = inputs.iter().find(|(_, is_dead)| *is_dead) {
        return Ok((value.clone(), true));
    }
    let kernel = registry.get(&def.op).ok_or_else(|| {
        GraphError::InvalidGraph(format!("no kernel registered for op {:?}", def.op))
    })?;
    // Kernels are synchronous compute; run them off the async path so
    // a heavy one cannot stall the partition's peers on this runtime
    // thread.
    tokio::task::spawn_blocking(move || {
        let values: Vec<TensorValue> = inputs.into_iter().map(|(value, _)| value).collect();
        kernel
            .compute(OpContext {
                node: &def,
                inputs: &values,
            })
            .map(|value| (value, false))
            .map_err(|err| GraphError::Kernel {
                op: def.op.clone(),
                node: def.name.clone(),
                source: err,
            })
    })
    .await
    .unwrap_or_else(|join_err| Err(GraphError::ExecutorFailed(join_err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tensorstep::tensor::DType;
    use tensorstep::worker::DeviceKind;

    fn device() -> DeviceName {
        DeviceName::new("w", DeviceKind::Cpu, 0).unwrap()
    }

    #[test]
    fn test_registry_builtins() {
        let registry = KernelRegistry::with_builtins();
        assert!(registry.contains("Const"));
        assert!(registry.contains("Identity"));
        assert!(!registry.contains("MatMul"));
    }

    #[test]
    fn test_const_kernel_emits_literal() {
        let value = TensorValue::scalar(DType::Int32, vec![1u8, 0, 0, 0]);
        let node = NodeDef::new("c", "Const", device())
            .with_attr("value", crate::graph::AttrValue::Tensor(value.clone()));
        let computed = ConstKernel
            .compute(OpContext {
                node: &node,
                inputs: &[],
            })
            .unwrap();
        assert_eq!(computed, value);
    }

    #[test]
    fn test_const_kernel_requires_value() {
        let node = NodeDef::new("c", "Const", device());
        assert!(
            ConstKernel
                .compute(OpContext {
                    node: &node,
                    inputs: &[],
                })
                .is_err()
        );
    }

    #[test]
    fn test_identity_kernel_passes_through() {
        let value = TensorValue::scalar(DType::Raw, vec![9u8]);
        let node = NodeDef::new("id", "Identity", device()).with_input("x");
        let computed = IdentityKernel
            .compute(OpContext {
                node: &node,
                inputs: std::slice::from_ref(&value),
            })
            .unwrap();
        assert_eq!(computed, value);
    }
}
