/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The process-wide step registry: one [`WorkerRendezvous`] per
//! `step_id`, created lazily, torn down explicitly.
//!
//! Many threads execute the same step concurrently (different nodes of
//! the same step), so [`find`] must be callable concurrently and must
//! never create two instances for one step. The whole table is guarded
//! by a single mutex; instances returned by [`find`] carry their own
//! locking and are used without the table lock.
//!
//! [`find`]: RendezvousManager::find

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::config::Config;
use crate::key::RendezvousKey;
use crate::remote::Transport;
use crate::remote::WorkerRendezvous;
use crate::rendezvous::RecvOk;
use crate::rendezvous::TransferError;
use crate::tensor::TransferArgs;

/// The step_id → rendezvous registry for one worker process. The
/// manager owns creation, lookup, and forced cleanup; it does not
/// initialize the instances it creates (callers do, with their
/// session).
#[derive(Debug)]
pub struct RendezvousManager {
    transport: Arc<dyn Transport>,
    config: Config,
    table: Mutex<HashMap<u64, WorkerRendezvous>>,
}

impl RendezvousManager {
    /// Create a manager whose rendezvous instances use the given
    /// transport for cross-worker receives.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, Config::default())
    }

    /// [`new`], with an explicit configuration.
    ///
    /// [`new`]: RendezvousManager::new
    pub fn with_config(transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            transport,
            config,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// The rendezvous for `step_id`, creating it if this is the first
    /// lookup. Find-or-create is atomic under the table lock:
    /// concurrent callers for one unseen step all receive the same
    /// instance.
    pub fn find(&self, step_id: u64) -> WorkerRendezvous {
        let mut table = self.table.lock().unwrap();
        table
            .entry(step_id)
            .or_insert_with(|| {
                tracing::trace!(name = "rendezvous_created", step_id, "creating step rendezvous");
                WorkerRendezvous::new(
                    step_id,
                    self.transport.clone(),
                    self.config.deferred_limit,
                )
            })
            .clone()
    }

    /// Receive a locally produced tensor for `step_id` on behalf of a
    /// remote consumer. This is the entry point an RPC service handler
    /// calls; it is safe to call from arbitrary runtime threads.
    pub async fn recv_local(
        &self,
        step_id: u64,
        key: RendezvousKey,
        args: TransferArgs,
    ) -> Result<RecvOk, TransferError> {
        self.find(step_id).recv_local(key, args).await
    }

    /// Blocking variant of [`recv_local`]: parks the calling thread
    /// until the receive completes. Must not be called from a runtime
    /// worker thread.
    ///
    /// [`recv_local`]: RendezvousManager::recv_local
    pub fn recv_local_sync(
        &self,
        step_id: u64,
        key: RendezvousKey,
        args: TransferArgs,
    ) -> Result<RecvOk, TransferError> {
        self.find(step_id).recv_local(key, args).wait()
    }

    /// Remove the entry for one step, aborting it so that any
    /// straggling operations on outstanding clones fail fast instead
    /// of hanging. A no-op if the step has no entry.
    pub fn cleanup(&self, step_id: u64) {
        let removed = self.table.lock().unwrap().remove(&step_id);
        if let Some(rendezvous) = removed {
            tracing::debug!(name = "rendezvous_cleanup", step_id, "cleaning up step");
            rendezvous.start_abort(TransferError::Cancelled(format!(
                "step {} cleaned up",
                step_id
            )));
        }
    }

    /// [`cleanup`] for every live step. Used at worker teardown.
    ///
    /// [`cleanup`]: RendezvousManager::cleanup
    pub fn cleanup_all(&self) {
        let drained: Vec<(u64, WorkerRendezvous)> =
            self.table.lock().unwrap().drain().collect();
        tracing::debug!(
            name = "rendezvous_cleanup_all",
            steps = drained.len(),
            "cleaning up all steps"
        );
        for (step_id, rendezvous) in drained {
            rendezvous.start_abort(TransferError::Cancelled(format!(
                "step {} cleaned up",
                step_id
            )));
        }
    }

    /// The number of live step entries. Diagnostic only.
    pub fn num_steps(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future;

    use crate::remote::RecvRequest;
    use crate::remote::RecvResponse;
    use crate::worker::WorkerSession;

    use super::*;

    #[derive(Debug)]
    struct NeverTransport;

    #[async_trait::async_trait]
    impl Transport for NeverTransport {
        async fn recv_remote(&self, _request: RecvRequest) -> Result<RecvResponse, TransferError> {
            future::pending().await
        }
    }

    fn manager() -> Arc<RendezvousManager> {
        Arc::new(RendezvousManager::new(Arc::new(NeverTransport)))
    }

    #[test]
    fn test_find_or_create_is_atomic() {
        let mgr = manager();
        let first = mgr.find(42);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || mgr.find(42))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().ptr_eq(&first));
        }
        assert_eq!(mgr.num_steps(), 1);
    }

    #[test]
    fn test_concurrent_find_unseen_step() {
        let mgr = manager();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || mgr.find(7))
            })
            .collect();
        let found: Vec<WorkerRendezvous> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for rendezvous in &found[1..] {
            assert!(rendezvous.ptr_eq(&found[0]));
        }
        mgr.cleanup_all();
        assert_eq!(mgr.num_steps(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_is_isolated() {
        let mgr = manager();
        let one = mgr.find(1);
        let two = mgr.find(2);
        one.initialize(Arc::new(WorkerSession::with_cpus("w", 1)))
            .unwrap();
        two.initialize(Arc::new(WorkerSession::with_cpus("w", 1)))
            .unwrap();

        mgr.cleanup(1);
        assert!(matches!(one.status(), Some(TransferError::Cancelled(_))));
        assert_eq!(two.status(), None);
        assert_eq!(mgr.num_steps(), 1);

        // A later find for the cleaned step mints a fresh instance.
        assert!(!mgr.find(1).ptr_eq(&one));
    }

    #[test]
    fn test_cleanup_missing_step_is_noop() {
        let mgr = manager();
        mgr.cleanup(99);
        assert_eq!(mgr.num_steps(), 0);
    }
}
