/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The worker rendezvous: a [`LocalRendezvous`] extended with network
//! awareness and a two-phase lifecycle.
//!
//! A freshly created instance accepts sends immediately (local sends
//! need no routing information), but receives require the owning
//! [`WorkerSession`] to resolve whether the producer is on this worker
//! or across a transport. Receives issued before [`initialize`] are
//! queued and replayed, in arrival order, once initialization
//! completes.
//!
//! Remote receives go through the [`Transport`] capability chosen at
//! construction. Each in-flight remote call is tracked so that
//! [`start_abort`] can cancel all of them; registration of a new call
//! checks the abort status under the same lock, so a call can never
//! slip in concurrently with an abort.
//!
//! [`initialize`]: WorkerRendezvous::initialize
//! [`start_abort`]: WorkerRendezvous::start_abort

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::key::RendezvousKey;
use crate::rendezvous::LocalRendezvous;
use crate::rendezvous::RecvFuture;
use crate::rendezvous::RecvOk;
use crate::rendezvous::TransferError;
use crate::tensor::TensorValue;
use crate::tensor::TransferArgs;
use crate::worker::WorkerSession;

/// A request for a tensor produced on a remote worker. The key names
/// both ends of the transfer; the producer worker is derived from the
/// key's source device.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecvRequest {
    /// The step whose rendezvous holds the tensor.
    pub step_id: u64,
    /// The parsed transfer key.
    pub key: RendezvousKey,
    /// The consumer's transfer args.
    pub args: TransferArgs,
}

/// The successful response to a [`RecvRequest`].
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecvResponse {
    /// The transferred value.
    pub value: TensorValue,
    /// Whether the producer marked the value dead.
    pub is_dead: bool,
    /// The producer's transfer args.
    pub producer_args: TransferArgs,
}

/// The capability to receive tensors from remote workers. Implemented
/// by transports (in-process routing, RPC clients); chosen when the
/// rendezvous is constructed. Implementations must be safe to call
/// from arbitrary runtime threads.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Issue a receive against the producer worker named by the
    /// request's key. Resolves when the producer's tensor is available
    /// or the transfer fails.
    async fn recv_remote(&self, request: RecvRequest) -> Result<RecvResponse, TransferError>;
}

type CallId = u64;

#[derive(Debug)]
struct DeferredRecv {
    key: RendezvousKey,
    args: TransferArgs,
    /// Whether this was a producer-side receive (the RPC-server hook)
    /// rather than a consumer-side one.
    local_only: bool,
    tx: oneshot::Sender<Result<RecvOk, TransferError>>,
}

#[derive(Debug, Default)]
struct Lifecycle {
    session: Option<Arc<WorkerSession>>,
    status: Option<TransferError>,
    deferred: VecDeque<DeferredRecv>,
    active_calls: HashMap<CallId, CancellationToken>,
}

#[derive(Debug)]
struct Inner {
    step_id: u64,
    local: LocalRendezvous,
    transport: Arc<dyn Transport>,
    deferred_limit: usize,
    lifecycle: Mutex<Lifecycle>,
    next_call_id: AtomicU64,
}

/// A step's rendezvous on one worker. Cheaply cloneable; all clones
/// share the same instance. See the module documentation for the
/// lifecycle contract.
#[derive(Debug, Clone)]
pub struct WorkerRendezvous {
    inner: Arc<Inner>,
}

impl WorkerRendezvous {
    pub(crate) fn new(step_id: u64, transport: Arc<dyn Transport>, deferred_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                step_id,
                local: LocalRendezvous::new(),
                transport,
                deferred_limit,
                lifecycle: Mutex::new(Lifecycle::default()),
                next_call_id: AtomicU64::new(0),
            }),
        }
    }

    /// The step this rendezvous belongs to.
    pub fn step_id(&self) -> u64 {
        self.inner.step_id
    }

    /// Whether `self` and `other` are the same underlying instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether [`initialize`] has completed.
    ///
    /// [`initialize`]: WorkerRendezvous::initialize
    pub fn is_initialized(&self) -> bool {
        self.inner.lifecycle.lock().unwrap().session.is_some()
    }

    /// Transition to the initialized state, capturing the session used
    /// to resolve device names, and replay any queued receives in their
    /// arrival order. Fails if already initialized or already aborted.
    pub fn initialize(&self, session: Arc<WorkerSession>) -> Result<(), TransferError> {
        self.init_inner(session, false)
    }

    /// [`initialize`], tolerating an instance already initialized with
    /// this same session. Used by callers that share a step rendezvous
    /// (input feeding, execution, output draining may each arrive
    /// first).
    ///
    /// [`initialize`]: WorkerRendezvous::initialize
    pub fn ensure_initialized(&self, session: &Arc<WorkerSession>) -> Result<(), TransferError> {
        self.init_inner(session.clone(), true)
    }

    fn init_inner(
        &self,
        session: Arc<WorkerSession>,
        tolerate_same: bool,
    ) -> Result<(), TransferError> {
        let replay = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if let Some(status) = &lifecycle.status {
                return Err(status.clone());
            }
            if let Some(existing) = &lifecycle.session {
                if tolerate_same && Arc::ptr_eq(existing, &session) {
                    return Ok(());
                }
                return Err(TransferError::InvalidArgument(format!(
                    "rendezvous for step {} already initialized",
                    self.inner.step_id
                )));
            }
            lifecycle.session = Some(session.clone());
            std::mem::take(&mut lifecycle.deferred)
        };
        tracing::debug!(
            name = "rendezvous_initialized",
            step_id = self.inner.step_id,
            worker = session.worker_name(),
            deferred = replay.len(),
            "initialized step rendezvous"
        );
        for call in replay {
            if call.local_only {
                self.route_recv_local(&session, call.key, call.args, call.tx);
            } else {
                self.route_recv(&session, call.key, call.args, call.tx);
            }
        }
        Ok(())
    }

    /// Deliver a value for `key` into this step's rendezvous. Local
    /// sends need no routing information, so this works before
    /// initialization; once a session is available the key's source
    /// device is validated against it.
    pub fn send(
        &self,
        key: RendezvousKey,
        args: TransferArgs,
        value: TensorValue,
        is_dead: bool,
    ) -> Result<(), TransferError> {
        let session = {
            let lifecycle = self.inner.lifecycle.lock().unwrap();
            if let Some(status) = &lifecycle.status {
                return Err(status.clone());
            }
            lifecycle.session.clone()
        };
        if let Some(session) = &session {
            Self::validate_devices(session, &key, true)?;
        }
        self.inner.local.send(key, args, value, is_dead)
    }

    /// Request the value for `key` on behalf of its consumer, which
    /// must be a device on this worker. Same-worker transfers resolve
    /// against the local table; transfers whose producer lives on
    /// another worker go through the transport. Requests issued before
    /// initialization are deferred.
    pub fn recv(&self, key: RendezvousKey, args: TransferArgs) -> RecvFuture {
        let (tx, future) = RecvFuture::pending();
        if let Some((session, key, args, tx)) = self.session_or_defer(key, args, false, tx) {
            self.route_recv(&session, key, args, tx);
        }
        future
    }

    /// Request the value for `key` on behalf of a remote consumer: the
    /// hook an RPC server calls when a peer asks for a tensor produced
    /// here. The key's source device must be owned by this worker (at
    /// its current incarnation). Requests issued before initialization
    /// are deferred.
    pub fn recv_local(&self, key: RendezvousKey, args: TransferArgs) -> RecvFuture {
        let (tx, future) = RecvFuture::pending();
        if let Some((session, key, args, tx)) = self.session_or_defer(key, args, true, tx) {
            self.route_recv_local(&session, key, args, tx);
        }
        future
    }

    /// Mark the rendezvous permanently failed: store the status (first
    /// write wins), abort the local table, cancel every in-flight
    /// remote call, and fail every still-deferred receive. Idempotent.
    pub fn start_abort(&self, status: TransferError) {
        let (calls, deferred) = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if lifecycle.status.is_some() {
                return;
            }
            lifecycle.status = Some(status.clone());
            (
                std::mem::take(&mut lifecycle.active_calls),
                std::mem::take(&mut lifecycle.deferred),
            )
        };
        tracing::debug!(
            name = "rendezvous_abort",
            step_id = self.inner.step_id,
            status = %status,
            active_calls = calls.len(),
            deferred = deferred.len(),
            "aborting step rendezvous"
        );
        self.inner.local.start_abort(status.clone());
        for (_, token) in calls {
            token.cancel();
        }
        for call in deferred {
            let _ = call.tx.send(Err(status.clone()));
        }
    }

    /// The stored abort status, if the rendezvous was aborted.
    pub fn status(&self) -> Option<TransferError> {
        self.inner.lifecycle.lock().unwrap().status.clone()
    }

    /// Resolve the session for a receive, or queue the receive when no
    /// session is available yet. Returns `None` when the request was
    /// deferred or failed fast (the channel is consumed either way).
    #[allow(clippy::type_complexity)]
    fn session_or_defer(
        &self,
        key: RendezvousKey,
        args: TransferArgs,
        local_only: bool,
        tx: oneshot::Sender<Result<RecvOk, TransferError>>,
    ) -> Option<(
        Arc<WorkerSession>,
        RendezvousKey,
        TransferArgs,
        oneshot::Sender<Result<RecvOk, TransferError>>,
    )> {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if let Some(status) = &lifecycle.status {
            let status = status.clone();
            drop(lifecycle);
            let _ = tx.send(Err(status));
            return None;
        }
        match &lifecycle.session {
            Some(session) => {
                let session = session.clone();
                drop(lifecycle);
                Some((session, key, args, tx))
            }
            None => {
                if lifecycle.deferred.len() >= self.inner.deferred_limit {
                    drop(lifecycle);
                    let _ = tx.send(Err(TransferError::InvalidArgument(format!(
                        "deferred receive limit ({}) reached for step {}",
                        self.inner.deferred_limit, self.inner.step_id
                    ))));
                    return None;
                }
                tracing::trace!(
                    name = "recv_deferred",
                    step_id = self.inner.step_id,
                    key = %key,
                    "deferring receive until initialization"
                );
                lifecycle.deferred.push_back(DeferredRecv {
                    key,
                    args,
                    local_only,
                    tx,
                });
                None
            }
        }
    }

    /// Route an initialized consumer-side receive.
    fn route_recv(
        &self,
        session: &Arc<WorkerSession>,
        key: RendezvousKey,
        args: TransferArgs,
        tx: oneshot::Sender<Result<RecvOk, TransferError>>,
    ) {
        // The consumer must be local in either case.
        if let Err(err) = Self::validate_devices(session, &key, false) {
            let _ = tx.send(Err(err));
            return;
        }
        if key.src_device().worker() == session.worker_name() {
            // Same-worker fast path. The payload handle is refcounted,
            // so a cross-device hand-off within the process needs no
            // copy; the local table resolves the match directly.
            if let Err(err) = Self::validate_devices(session, &key, true) {
                let _ = tx.send(Err(err));
                return;
            }
            self.inner.local.recv_into(key, args, tx);
        } else {
            self.recv_from_remote(key, args, tx);
        }
    }

    /// Route an initialized producer-side receive (the RPC-server
    /// hook).
    fn route_recv_local(
        &self,
        session: &Arc<WorkerSession>,
        key: RendezvousKey,
        args: TransferArgs,
        tx: oneshot::Sender<Result<RecvOk, TransferError>>,
    ) {
        if let Err(err) = Self::validate_devices(session, &key, true) {
            let _ = tx.send(Err(err));
            return;
        }
        self.inner.local.recv_into(key, args, tx);
    }

    /// Issue a transport receive for a tensor produced on another
    /// worker, tracked in the active-call table so an abort can cancel
    /// it.
    fn recv_from_remote(
        &self,
        key: RendezvousKey,
        args: TransferArgs,
        tx: oneshot::Sender<Result<RecvOk, TransferError>>,
    ) {
        let (call_id, token) = match self.register_call() {
            Ok(registered) => registered,
            Err(status) => {
                let _ = tx.send(Err(status));
                return;
            }
        };
        let request = RecvRequest {
            step_id: self.inner.step_id,
            key,
            args: args.clone(),
        };
        tracing::trace!(
            name = "recv_remote_start",
            step_id = self.inner.step_id,
            key = %request.key,
            call_id,
            "issuing remote receive"
        );
        let this = self.clone();
        let transport = self.inner.transport.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(this
                    .status()
                    .unwrap_or_else(|| {
                        TransferError::Cancelled("remote receive cancelled".to_string())
                    })),
                response = transport.recv_remote(request) => {
                    response.map(|response| RecvOk {
                        producer_args: response.producer_args,
                        consumer_args: args,
                        value: response.value,
                        is_dead: response.is_dead,
                    })
                }
            };
            this.deregister_call(call_id);
            let _ = tx.send(result);
        });
    }

    /// Track a new in-flight remote call. The abort check and the
    /// insertion happen under one lock, so registration can never race
    /// with [`start_abort`]: either the call is cancelled by the abort,
    /// or it fails here with the stored status.
    ///
    /// [`start_abort`]: WorkerRendezvous::start_abort
    fn register_call(&self) -> Result<(CallId, CancellationToken), TransferError> {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if let Some(status) = &lifecycle.status {
            return Err(status.clone());
        }
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        lifecycle.active_calls.insert(call_id, token.clone());
        Ok((call_id, token))
    }

    fn deregister_call(&self, call_id: CallId) {
        self.inner
            .lifecycle
            .lock()
            .unwrap()
            .active_calls
            .remove(&call_id);
    }

    /// Check that the device the key claims for this end of the
    /// transfer is owned by the session's worker; for the producer
    /// side, also check that the key's incarnation is current. A
    /// mismatch is an invariant violation reported as an error, never a
    /// panic.
    fn validate_devices(
        session: &WorkerSession,
        key: &RendezvousKey,
        is_src: bool,
    ) -> Result<(), TransferError> {
        let device = if is_src {
            key.src_device()
        } else {
            key.dst_device()
        };
        if !session.owns_device(device) {
            return Err(TransferError::DeviceMismatch(format!(
                "device {} in key {} is not owned by worker {}",
                device,
                key,
                session.worker_name()
            )));
        }
        if is_src {
            let current = session.devices().incarnation(device);
            if current != Some(key.src_incarnation()) {
                return Err(TransferError::DeviceMismatch(format!(
                    "key {} names a stale incarnation of device {}",
                    key, device
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::future;

    use crate::key::FrameIter;
    use crate::tensor::DType;
    use crate::worker::DeviceKind;
    use crate::worker::DeviceName;

    use super::*;

    /// A transport whose receives never complete; remote calls stay
    /// in flight until aborted.
    #[derive(Debug)]
    struct NeverTransport;

    #[async_trait]
    impl Transport for NeverTransport {
        async fn recv_remote(&self, _request: RecvRequest) -> Result<RecvResponse, TransferError> {
            future::pending().await
        }
    }

    fn session() -> Arc<WorkerSession> {
        Arc::new(WorkerSession::with_cpus("w", 2))
    }

    fn rendezvous() -> WorkerRendezvous {
        WorkerRendezvous::new(7, Arc::new(NeverTransport), 16)
    }

    fn local_key(session: &WorkerSession, name: &str) -> RendezvousKey {
        let src = DeviceName::new("w", DeviceKind::Cpu, 0).unwrap();
        let incarnation = session.devices().incarnation(&src).unwrap();
        RendezvousKey::new(
            src,
            incarnation,
            DeviceName::new("w", DeviceKind::Cpu, 1).unwrap(),
            name,
            FrameIter::ROOT,
        )
        .unwrap()
    }

    fn remote_key(name: &str) -> RendezvousKey {
        RendezvousKey::new(
            DeviceName::new("elsewhere", DeviceKind::Cpu, 0).unwrap(),
            1,
            DeviceName::new("w", DeviceKind::Cpu, 0).unwrap(),
            name,
            FrameIter::ROOT,
        )
        .unwrap()
    }

    fn value() -> TensorValue {
        TensorValue::scalar(DType::Raw, vec![1u8, 2, 3])
    }

    #[tokio::test]
    async fn test_send_works_before_initialize() {
        let session = session();
        let rz = rendezvous();
        let key = local_key(&session, "x");

        // Not yet initialized: the send buffers locally.
        rz.send(key.clone(), TransferArgs::default(), value(), false)
            .unwrap();

        rz.initialize(session).unwrap();
        let received = rz.recv(key, TransferArgs::default()).await.unwrap();
        assert_eq!(received.value, value());
    }

    #[tokio::test]
    async fn test_deferred_recvs_replay_in_order() {
        let session = session();
        let rz = rendezvous();
        let key = local_key(&session, "x");

        // Two receives for the same key are queued before
        // initialization. Replay preserves arrival order: the first
        // becomes the key's waiter, the second is the duplicate.
        let first = rz.recv(key.clone(), TransferArgs::default());
        let second = rz.recv(key.clone(), TransferArgs::default());

        rz.initialize(session).unwrap();
        let err = second.await.unwrap_err();
        assert!(matches!(err, TransferError::DuplicateRecv(_)));

        rz.send(key, TransferArgs::default(), value(), false)
            .unwrap();
        assert_eq!(first.await.unwrap().value, value());
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let session = session();
        let rz = rendezvous();
        rz.initialize(session.clone()).unwrap();
        let err = rz.initialize(session.clone()).unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));

        // The tolerant variant accepts the same session, but not a
        // different one.
        rz.ensure_initialized(&session).unwrap();
        let other = Arc::new(WorkerSession::with_cpus("w", 2));
        assert!(rz.ensure_initialized(&other).is_err());
    }

    #[tokio::test]
    async fn test_initialize_after_abort_fails() {
        let rz = rendezvous();
        let status = TransferError::Aborted("down".to_string());
        rz.start_abort(status.clone());
        let err = rz.initialize(session()).unwrap_err();
        assert_eq!(err, status);
    }

    #[tokio::test]
    async fn test_abort_cancels_in_flight_remote_recv() {
        let rz = rendezvous();
        rz.initialize(session()).unwrap();

        let pending = rz.recv(remote_key("t"), TransferArgs::default());
        // The transport never completes; only the abort can resolve
        // this receive.
        let status = TransferError::Aborted("peer lost".to_string());
        rz.start_abort(status.clone());
        assert_eq!(pending.await.unwrap_err(), status);
    }

    #[tokio::test]
    async fn test_remote_recv_after_abort_fails_fast() {
        let rz = rendezvous();
        rz.initialize(session()).unwrap();
        let status = TransferError::Aborted("peer lost".to_string());
        rz.start_abort(status.clone());
        let err = rz
            .recv(remote_key("t"), TransferArgs::default())
            .await
            .unwrap_err();
        assert_eq!(err, status);
    }

    #[tokio::test]
    async fn test_abort_fails_deferred_recvs() {
        let rz = rendezvous();
        let pending = rz.recv(remote_key("t"), TransferArgs::default());
        let status = TransferError::Aborted("torn down".to_string());
        rz.start_abort(status.clone());
        assert_eq!(pending.await.unwrap_err(), status);
    }

    #[tokio::test]
    async fn test_recv_validates_consumer_device() {
        let session = session();
        let rz = rendezvous();
        rz.initialize(session.clone()).unwrap();

        // Destination names a device on another worker.
        let key = RendezvousKey::new(
            DeviceName::new("w", DeviceKind::Cpu, 0).unwrap(),
            session
                .devices()
                .incarnation(&DeviceName::new("w", DeviceKind::Cpu, 0).unwrap())
                .unwrap(),
            DeviceName::new("elsewhere", DeviceKind::Cpu, 0).unwrap(),
            "t",
            FrameIter::ROOT,
        )
        .unwrap();
        let err = rz.recv(key, TransferArgs::default()).await.unwrap_err();
        assert!(matches!(err, TransferError::DeviceMismatch(_)));
    }

    #[tokio::test]
    async fn test_recv_local_rejects_stale_incarnation() {
        let session = session();
        let rz = rendezvous();
        rz.initialize(session.clone()).unwrap();

        let src = DeviceName::new("w", DeviceKind::Cpu, 0).unwrap();
        let stale = session.devices().incarnation(&src).unwrap().wrapping_add(1);
        let key = RendezvousKey::new(
            src,
            stale,
            DeviceName::new("elsewhere", DeviceKind::Cpu, 0).unwrap(),
            "t",
            FrameIter::ROOT,
        )
        .unwrap();
        let err = rz
            .recv_local(key, TransferArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DeviceMismatch(_)));
    }

    #[tokio::test]
    async fn test_recv_local_serves_buffered_value() {
        let session = session();
        let rz = rendezvous();
        rz.initialize(session.clone()).unwrap();

        let src = DeviceName::new("w", DeviceKind::Cpu, 0).unwrap();
        let key = RendezvousKey::new(
            src.clone(),
            session.devices().incarnation(&src).unwrap(),
            DeviceName::new("elsewhere", DeviceKind::Cpu, 0).unwrap(),
            "t",
            FrameIter::ROOT,
        )
        .unwrap();
        rz.send(key.clone(), TransferArgs::default(), value(), false)
            .unwrap();
        let received = rz.recv_local(key, TransferArgs::default()).await.unwrap();
        assert_eq!(received.value, value());
    }

    #[tokio::test]
    async fn test_deferred_limit() {
        let rz = WorkerRendezvous::new(7, Arc::new(NeverTransport), 1);
        let _first = rz.recv(remote_key("a"), TransferArgs::default());
        let err = rz
            .recv(remote_key("b"), TransferArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArgument(_)));
    }
}
