/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Graph representation and partition planning.
//!
//! A [`GraphDef`] is externally constructed: a list of named nodes,
//! each assigned to a device of the registering worker. Planning
//! validates device assignments and acyclicity, groups nodes into one
//! partition per device, and rewrites every edge that crosses a
//! partition boundary into a rendezvous transfer pair.
//!
//! Four structural ops are owned by the executor rather than by
//! kernels:
//!
//! | Op        | Meaning                                              |
//! |-----------|------------------------------------------------------|
//! | `_Arg`    | A step input, fed by the client under the node name  |
//! | `_Retval` | A step output, drained by the client under the name  |
//! | `_Recv`   | A transfer from another worker's device              |
//! | `_Send`   | A transfer to another worker's device                |
//!
//! Cross-worker `_Send`/`_Recv` pairs are matched by node name: both
//! sides of the pair carry the same name, which becomes the transfer's
//! tensor name. Edges between devices of the registering worker need
//! no explicit nodes; planning inserts the transfers itself.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use tensorstep::key::FrameIter;
use tensorstep::rendezvous::TransferError;
use tensorstep::tensor::TensorValue;
use tensorstep::worker::DeviceName;
use tensorstep::worker::WorkerSession;

/// The step-input op name.
pub const OP_ARG: &str = "_Arg";
/// The step-output op name.
pub const OP_RETVAL: &str = "_Retval";
/// The cross-worker receive op name.
pub const OP_RECV: &str = "_Recv";
/// The cross-worker send op name.
pub const OP_SEND: &str = "_Send";

/// Errors raised by graph registration and step execution.
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    /// The named handle is not registered.
    #[error("unknown graph handle: {0}")]
    UnknownHandle(String),

    /// The graph failed structural validation.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// A rendezvous operation failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A kernel reported a computation failure.
    #[error("kernel {op} failed on node {node}: {source}")]
    Kernel {
        /// The failing kernel's op name.
        op: String,
        /// The node being computed.
        node: String,
        /// The kernel's error.
        #[source]
        source: anyhow::Error,
    },

    /// A drained output was a dead tensor.
    #[error("dead output tensor: {0}")]
    DeadOutput(String),

    /// A partition's execution task panicked or was torn down.
    #[error("execution task failed: {0}")]
    ExecutorFailed(String),
}

/// A node attribute value.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum AttrValue {
    /// A tensor literal (e.g. a `Const` node's value).
    Tensor(TensorValue),
    /// A signed integer.
    Int(i64),
    /// An unsigned integer (e.g. a device incarnation).
    UInt(u64),
    /// A string.
    Str(String),
}

/// One node of a graph: a unique name, an op, a device assignment, the
/// names of its input nodes, and op-specific attributes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeDef {
    /// The node's unique name within the graph.
    pub name: String,
    /// The node's op.
    pub op: String,
    /// The device the node is assigned to.
    pub device: DeviceName,
    /// The names of the nodes producing this node's inputs, in input
    /// order.
    pub inputs: Vec<String>,
    /// Op-specific attributes.
    pub attrs: HashMap<String, AttrValue>,
}

impl NodeDef {
    /// Create a node with no inputs and no attributes.
    pub fn new(name: impl Into<String>, op: impl Into<String>, device: DeviceName) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            device,
            inputs: Vec::new(),
            attrs: HashMap::new(),
        }
    }

    /// Append an input node name.
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// Set an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// The `key` attribute as a tensor literal, if present and typed
    /// so.
    pub fn attr_tensor(&self, key: &str) -> Option<&TensorValue> {
        match self.attrs.get(key) {
            Some(AttrValue::Tensor(value)) => Some(value),
            _ => None,
        }
    }

    /// The `key` attribute as a string, if present and typed so.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key) {
            Some(AttrValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    /// The `key` attribute as an unsigned integer, if present and
    /// typed so.
    pub fn attr_uint(&self, key: &str) -> Option<u64> {
        match self.attrs.get(key) {
            Some(AttrValue::UInt(value)) => Some(*value),
            _ => None,
        }
    }
}

/// An externally constructed graph: the nodes, in any order.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GraphDef {
    /// The graph's nodes.
    pub nodes: Vec<NodeDef>,
}

impl GraphDef {
    /// Create a graph from its nodes.
    pub fn new(nodes: Vec<NodeDef>) -> Self {
        Self { nodes }
    }
}

/// Where a planned node's input comes from at step time.
#[derive(Debug, Clone)]
pub(crate) enum ValueRef {
    /// Produced by an earlier node of the same partition.
    Local(String),
    /// Produced on another device; received through the step
    /// rendezvous under the producer's node name.
    Transfer {
        src: DeviceName,
        src_incarnation: u64,
        name: String,
    },
}

/// The executor-facing classification of a planned node.
#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    /// Receive a step input from the client device.
    Arg {
        client: DeviceName,
        client_incarnation: u64,
    },
    /// Send the input to the client device as a step output.
    Ret { client: DeviceName },
    /// Receive a transfer from another worker's device.
    Recv {
        src: DeviceName,
        src_incarnation: u64,
    },
    /// Send the input to another worker's device.
    Send { dst: DeviceName },
    /// Run the registered kernel for the node's op.
    Compute,
}

/// One node, planned: its definition, its kind, where its inputs come
/// from, and which same-worker devices consume its value.
#[derive(Debug, Clone)]
pub(crate) struct PlannedNode {
    pub def: NodeDef,
    pub kind: NodeKind,
    pub inputs: Vec<ValueRef>,
    /// Devices of this worker hosting consumers of this node's value,
    /// deduplicated. One send per device, regardless of how many
    /// consumers it hosts.
    pub remote_consumers: Vec<DeviceName>,
}

/// The nodes assigned to one device, in an order consistent with the
/// whole graph's topological order (so that cross-partition waits
/// always make progress).
#[derive(Debug, Clone)]
pub(crate) struct PartitionPlan {
    pub device: DeviceName,
    pub incarnation: u64,
    pub nodes: Vec<PlannedNode>,
}

/// A planned graph: its partitions plus the input/output wiring used
/// by `send_inputs` and `recv_outputs`.
#[derive(Debug, Clone)]
pub(crate) struct GraphPlan {
    pub partitions: Vec<PartitionPlan>,
    /// Step input name → device of its `_Arg` node.
    pub args: HashMap<String, DeviceName>,
    /// Step output name → (device, incarnation) of its `_Retval` node.
    pub rets: HashMap<String, (DeviceName, u64)>,
    /// The client device and its incarnation, when the graph has
    /// inputs or outputs.
    pub client: Option<(DeviceName, u64)>,
}

fn invalid(message: impl Into<String>) -> GraphError {
    GraphError::InvalidGraph(message.into())
}

/// Validate `gdef` against `session` and plan its execution. See the
/// module documentation for the rules.
pub(crate) fn plan(gdef: &GraphDef, session: &WorkerSession) -> Result<GraphPlan, GraphError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in gdef.nodes.iter().enumerate() {
        if node.name.is_empty() || node.name.contains(';') {
            return Err(invalid(format!("invalid node name {:?}", node.name)));
        }
        if index.insert(node.name.as_str(), i).is_some() {
            return Err(invalid(format!("duplicate node name {:?}", node.name)));
        }
    }

    let mut terminal: HashSet<&str> = HashSet::new();
    for node in &gdef.nodes {
        if !session.owns_device(&node.device) {
            return Err(invalid(format!(
                "node {:?} is assigned to device {}, which worker {} does not own",
                node.name,
                node.device,
                session.worker_name()
            )));
        }
        let arity = match node.op.as_str() {
            OP_ARG | OP_RECV => Some(0),
            OP_RETVAL | OP_SEND => Some(1),
            "Const" => Some(0),
            "Identity" => Some(1),
            _ => None,
        };
        if let Some(arity) = arity {
            if node.inputs.len() != arity {
                return Err(invalid(format!(
                    "node {:?} ({}) takes {} inputs, got {}",
                    node.name,
                    node.op,
                    arity,
                    node.inputs.len()
                )));
            }
        }
        if node.op == OP_SEND || node.op == OP_RETVAL {
            terminal.insert(node.name.as_str());
        }
        if node.op == "Const" && node.attr_tensor("value").is_none() {
            return Err(invalid(format!(
                "Const node {:?} is missing its value attribute",
                node.name
            )));
        }
        for input in &node.inputs {
            if !index.contains_key(input.as_str()) {
                return Err(invalid(format!(
                    "node {:?} consumes unknown node {:?}",
                    node.name, input
                )));
            }
        }
    }
    for node in &gdef.nodes {
        for input in &node.inputs {
            if terminal.contains(input.as_str()) {
                return Err(invalid(format!(
                    "node {:?} consumes terminal node {:?}",
                    node.name, input
                )));
            }
        }
    }

    // Kahn's topological order over the whole graph; the per-partition
    // node order below inherits it.
    let mut indegree: Vec<usize> = gdef.nodes.iter().map(|n| n.inputs.len()).collect();
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); gdef.nodes.len()];
    for (i, node) in gdef.nodes.iter().enumerate() {
        for input in &node.inputs {
            consumers[index[input.as_str()]].push(i);
        }
    }
    let mut queue: VecDeque<usize> = (0..gdef.nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(gdef.nodes.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &consumer in &consumers[i] {
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                queue.push_back(consumer);
            }
        }
    }
    if order.len() != gdef.nodes.len() {
        return Err(invalid("graph contains a cycle"));
    }

    let needs_client = gdef
        .nodes
        .iter()
        .any(|n| n.op == OP_ARG || n.op == OP_RETVAL);
    let client = match session.client_device() {
        Some(device) => {
            let incarnation = session
                .devices()
                .incarnation(&device)
                .expect("client device is in the session's device set");
            Some((device, incarnation))
        }
        None if needs_client => {
            return Err(invalid(format!(
                "graph has step inputs or outputs but worker {} has no CPU:0 client device",
                session.worker_name()
            )));
        }
        None => None,
    };

    let mut args: HashMap<String, DeviceName> = HashMap::new();
    let mut rets: HashMap<String, (DeviceName, u64)> = HashMap::new();
    let mut partitions: Vec<PartitionPlan> = Vec::new();
    let mut partition_of: HashMap<DeviceName, usize> = HashMap::new();

    for &i in &order {
        let node = &gdef.nodes[i];
        let incarnation = session
            .devices()
            .incarnation(&node.device)
            .expect("device ownership validated above");

        let kind = match node.op.as_str() {
            OP_ARG => {
                let (client, client_incarnation) =
                    client.clone().expect("client device checked above");
                args.insert(node.name.clone(), node.device.clone());
                NodeKind::Arg {
                    client,
                    client_incarnation,
                }
            }
            OP_RETVAL => {
                let (client, _) = client.clone().expect("client device checked above");
                rets.insert(node.name.clone(), (node.device.clone(), incarnation));
                NodeKind::Ret { client }
            }
            OP_RECV => {
                let src: DeviceName = node
                    .attr_str("src_device")
                    .ok_or_else(|| {
                        invalid(format!(
                            "_Recv node {:?} is missing its src_device attribute",
                            node.name
                        ))
                    })?
                    .parse()
                    .map_err(|err| {
                        invalid(format!("_Recv node {:?}: {}", node.name, err))
                    })?;
                let src_incarnation = node.attr_uint("src_incarnation").ok_or_else(|| {
                    invalid(format!(
                        "_Recv node {:?} is missing its src_incarnation attribute",
                        node.name
                    ))
                })?;
                NodeKind::Recv {
                    src,
                    src_incarnation,
                }
            }
            OP_SEND => {
                let dst: DeviceName = node
                    .attr_str("dst_device")
                    .ok_or_else(|| {
                        invalid(format!(
                            "_Send node {:?} is missing its dst_device attribute",
                            node.name
                        ))
                    })?
                    .parse()
                    .map_err(|err| {
                        invalid(format!("_Send node {:?}: {}", node.name, err))
                    })?;
                NodeKind::Send { dst }
            }
            _ => NodeKind::Compute,
        };

        let inputs = node
            .inputs
            .iter()
            .map(|input| {
                let producer = &gdef.nodes[index[input.as_str()]];
                if producer.device == node.device {
                    ValueRef::Local(producer.name.clone())
                } else {
                    ValueRef::Transfer {
                        src: producer.device.clone(),
                        src_incarnation: session
                            .devices()
                            .incarnation(&producer.device)
                            .expect("device ownership validated above"),
                        name: producer.name.clone(),
                    }
                }
            })
            .collect();

        // One send per consuming device of this worker.
        let mut remote_consumers: Vec<DeviceName> = Vec::new();
        for &consumer in &consumers[i] {
            let device = &gdef.nodes[consumer].device;
            if device != &node.device && !remote_consumers.contains(device) {
                remote_consumers.push(device.clone());
            }
        }

        let planned = PlannedNode {
            def: node.clone(),
            kind,
            inputs,
            remote_consumers,
        };
        let partition = *partition_of.entry(node.device.clone()).or_insert_with(|| {
            partitions.push(PartitionPlan {
                device: node.device.clone(),
                incarnation,
                nodes: Vec::new(),
            });
            partitions.len() - 1
        });
        partitions[partition].nodes.push(planned);
    }

    Ok(GraphPlan {
        partitions,
        args,
        rets,
        client,
    })
}

/// The key for one planned transfer. Both sides call this with the
/// same arguments, so both compute the identical key.
pub(crate) fn transfer_key(
    src: &DeviceName,
    src_incarnation: u64,
    dst: &DeviceName,
    name: &str,
) -> Result<tensorstep::key::RendezvousKey, GraphError> {
    tensorstep::key::RendezvousKey::new(
        src.clone(),
        src_incarnation,
        dst.clone(),
        name,
        FrameIter::ROOT,
    )
    .map_err(|err| GraphError::Transfer(err.into()))
}

#[cfg(test)]
mod tests {
    use tensorstep::worker::DeviceKind;

    use super::*;

    fn device(index: u32) -> DeviceName {
        DeviceName::new("w", DeviceKind::Cpu, index).unwrap()
    }

    fn session() -> WorkerSession {
        WorkerSession::with_cpus("w", 2)
    }

    #[test]
    fn test_plan_partitions_by_device() {
        let session = session();
        let gdef = GraphDef::new(vec![
            NodeDef::new("x", OP_ARG, device(0)),
            NodeDef::new("id", "Identity", device(1)).with_input("x"),
            NodeDef::new("y", OP_RETVAL, device(0)).with_input("id"),
        ]);
        let plan = plan(&gdef, &session).unwrap();
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(plan.args.len(), 1);
        assert_eq!(plan.rets.len(), 1);

        // The cross-device edges became transfers.
        let unit1 = plan
            .partitions
            .iter()
            .find(|p| p.device == device(1))
            .unwrap();
        assert!(matches!(
            unit1.nodes[0].inputs[0],
            ValueRef::Transfer { .. }
        ));
        assert_eq!(unit1.nodes[0].remote_consumers, vec![device(0)]);
    }

    #[test]
    fn test_plan_orders_partitions_topologically() {
        let session = session();
        // Declared in reverse order; planning must still schedule the
        // producer first.
        let gdef = GraphDef::new(vec![
            NodeDef::new("y", OP_RETVAL, device(0)).with_input("id"),
            NodeDef::new("id", "Identity", device(0)).with_input("x"),
            NodeDef::new("x", OP_ARG, device(0)),
        ]);
        let plan = plan(&gdef, &session).unwrap();
        let names: Vec<&str> = plan.partitions[0]
            .nodes
            .iter()
            .map(|n| n.def.name.as_str())
            .collect();
        assert_eq!(names, vec!["x", "id", "y"]);
    }

    #[test]
    fn test_plan_rejects_duplicate_names() {
        let gdef = GraphDef::new(vec![
            NodeDef::new("x", OP_ARG, device(0)),
            NodeDef::new("x", OP_ARG, device(0)),
        ]);
        assert!(matches!(
            plan(&gdef, &session()),
            Err(GraphError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_plan_rejects_unowned_device() {
        let foreign = DeviceName::new("other", DeviceKind::Cpu, 0).unwrap();
        let gdef = GraphDef::new(vec![NodeDef::new("x", OP_ARG, foreign)]);
        assert!(matches!(
            plan(&gdef, &session()),
            Err(GraphError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_plan_rejects_cycle() {
        let gdef = GraphDef::new(vec![
            NodeDef::new("a", "Identity", device(0)).with_input("b"),
            NodeDef::new("b", "Identity", device(0)).with_input("a"),
        ]);
        assert!(matches!(
            plan(&gdef, &session()),
            Err(GraphError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_plan_rejects_consuming_terminal_node() {
        let gdef = GraphDef::new(vec![
            NodeDef::new("x", OP_ARG, device(0)),
            NodeDef::new("y", OP_RETVAL, device(0)).with_input("x"),
            NodeDef::new("z", "Identity", device(0)).with_input("y"),
        ]);
        assert!(matches!(
            plan(&gdef, &session()),
            Err(GraphError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_plan_rejects_recv_without_attrs() {
        let gdef = GraphDef::new(vec![NodeDef::new("t", OP_RECV, device(0))]);
        assert!(matches!(
            plan(&gdef, &session()),
            Err(GraphError::InvalidGraph(_))
        ));
    }
}
