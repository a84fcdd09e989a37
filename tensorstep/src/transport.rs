/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-process transport: routes remote receives between
//! [`RendezvousManager`]s registered in a shared router table, keyed by
//! worker name. This is the transport used by tests and by
//! multi-worker topologies hosted in a single process; network
//! transports implement the same [`Transport`] trait against an RPC
//! client instead.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::mgr::RendezvousManager;
use crate::remote::RecvRequest;
use crate::remote::RecvResponse;
use crate::remote::Transport;
use crate::rendezvous::TransferError;

/// A worker-name → manager routing table shared by every
/// [`InProcessTransport`] in the process.
#[derive(Debug, Default)]
pub struct TransportRouter {
    workers: DashMap<String, Arc<RendezvousManager>>,
}

impl TransportRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the manager serving the named worker.
    pub fn register(&self, worker_name: impl Into<String>, manager: Arc<RendezvousManager>) {
        let worker_name = worker_name.into();
        tracing::debug!(
            name = "transport_register",
            worker = worker_name.as_str(),
            "registering worker route"
        );
        self.workers.insert(worker_name, manager);
    }

    /// Remove the named worker's route. Receives targeting it fail
    /// with [`TransferError::NotFound`] afterwards.
    pub fn unregister(&self, worker_name: &str) {
        self.workers.remove(worker_name);
    }

    fn lookup(&self, worker_name: &str) -> Result<Arc<RendezvousManager>, TransferError> {
        self.workers
            .get(worker_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TransferError::NotFound(format!("worker {} is not registered", worker_name))
            })
    }
}

/// A [`Transport`] that resolves remote receives against the managers
/// in a [`TransportRouter`]. The producer worker is derived from the
/// request key's source device.
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    router: Arc<TransportRouter>,
}

impl InProcessTransport {
    /// Create a transport routing through the given table.
    pub fn new(router: Arc<TransportRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn recv_remote(&self, request: RecvRequest) -> Result<RecvResponse, TransferError> {
        let manager = self.router.lookup(request.key.src_device().worker())?;
        let received = manager
            .recv_local(request.step_id, request.key, request.args)
            .await?;
        Ok(RecvResponse {
            value: received.value,
            is_dead: received.is_dead,
            producer_args: received.producer_args,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::key::FrameIter;
    use crate::key::RendezvousKey;
    use crate::tensor::DType;
    use crate::tensor::TensorValue;
    use crate::tensor::TransferArgs;
    use crate::worker::DeviceKind;
    use crate::worker::DeviceName;
    use crate::worker::WorkerSession;

    use super::*;

    /// Two workers in one process, connected through the router.
    fn two_workers() -> (
        Arc<WorkerSession>,
        Arc<RendezvousManager>,
        Arc<WorkerSession>,
        Arc<RendezvousManager>,
    ) {
        let router = Arc::new(TransportRouter::new());
        let transport = Arc::new(InProcessTransport::new(router.clone()));

        let producer_session = Arc::new(WorkerSession::with_cpus("producer", 1));
        let producer_mgr = Arc::new(RendezvousManager::new(transport.clone()));
        router.register("producer", producer_mgr.clone());

        let consumer_session = Arc::new(WorkerSession::with_cpus("consumer", 1));
        let consumer_mgr = Arc::new(RendezvousManager::new(transport));
        router.register("consumer", consumer_mgr.clone());

        (producer_session, producer_mgr, consumer_session, consumer_mgr)
    }

    fn transfer_key(producer: &WorkerSession, name: &str) -> RendezvousKey {
        let src = DeviceName::new("producer", DeviceKind::Cpu, 0).unwrap();
        RendezvousKey::new(
            src.clone(),
            producer.devices().incarnation(&src).unwrap(),
            DeviceName::new("consumer", DeviceKind::Cpu, 0).unwrap(),
            name,
            FrameIter::ROOT,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cross_worker_transfer() {
        let (producer_session, producer_mgr, consumer_session, consumer_mgr) = two_workers();
        let step_id = 11;

        let producer_rz = producer_mgr.find(step_id);
        producer_rz.initialize(producer_session.clone()).unwrap();
        let consumer_rz = consumer_mgr.find(step_id);
        consumer_rz.initialize(consumer_session).unwrap();

        let key = transfer_key(&producer_session, "activations");
        let value = TensorValue::new(DType::Float32, vec![2, 2], vec![0u8; 16]);

        // Consumer asks first; the producer's send then flows through
        // the router.
        let pending = consumer_rz.recv(key.clone(), TransferArgs::default());
        producer_rz
            .send(key, TransferArgs::default(), value.clone(), false)
            .unwrap();

        let received = pending.await.unwrap();
        assert_eq!(received.value, value);
    }

    #[tokio::test]
    async fn test_unregistered_worker_fails() {
        let router = Arc::new(TransportRouter::new());
        let transport = Arc::new(InProcessTransport::new(router.clone()));
        let consumer_session = Arc::new(WorkerSession::with_cpus("consumer", 1));
        let consumer_mgr = Arc::new(RendezvousManager::new(transport));
        router.register("consumer", consumer_mgr.clone());

        let rz = consumer_mgr.find(1);
        rz.initialize(consumer_session).unwrap();

        let key = RendezvousKey::new(
            DeviceName::new("ghost", DeviceKind::Cpu, 0).unwrap(),
            1,
            DeviceName::new("consumer", DeviceKind::Cpu, 0).unwrap(),
            "t",
            FrameIter::ROOT,
        )
        .unwrap();
        let err = rz.recv(key, TransferArgs::default()).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }
}
