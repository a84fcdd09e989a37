/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The local rendezvous: a table of single-producer, single-consumer
//! exchange slots keyed by [`RendezvousKey`]. A producer [`send`]s a
//! tensor, a consumer [`recv`]s it; either side may arrive first. A
//! matched pair resolves and removes the slot.
//!
//! [`send`]: LocalRendezvous::send
//! [`recv`]: LocalRendezvous::recv
//!
//! ```
//! # use tensorstep::rendezvous::LocalRendezvous;
//! # use tensorstep::key::{FrameIter, RendezvousKey};
//! # use tensorstep::tensor::{DType, TensorValue, TransferArgs};
//! # tokio_test::block_on(async {
//! let rendezvous = LocalRendezvous::new();
//! let key: RendezvousKey =
//!     "w/device:CPU:0;1;w/device:CPU:1;x;0:0".parse().unwrap();
//! let value = TensorValue::scalar(DType::Int32, vec![5u8, 0, 0, 0]);
//!
//! rendezvous
//!     .send(key.clone(), TransferArgs::default(), value.clone(), false)
//!     .unwrap();
//! let received = rendezvous.recv(key, TransferArgs::default()).await.unwrap();
//! assert_eq!(received.value, value);
//! # })
//! ```
//!
//! Sends never block and never await: a send either completes a waiting
//! receiver inline or buffers. Receives never block the calling thread:
//! [`recv`] returns a future that is resolved by the matching send (or
//! immediately, if the value is already buffered).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::key::KeyParsingError;
use crate::key::RendezvousKey;
use crate::tensor::TensorItem;
use crate::tensor::TensorValue;
use crate::tensor::TransferArgs;

/// Errors surfaced by rendezvous operations. The enum is `Clone` so a
/// stored abort status can fan out to every pending and future caller.
#[derive(thiserror::Error, Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// A malformed or unparseable rendezvous key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A malformed argument other than the key.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A handle, step, worker, or tensor that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation was halted by cancellation before completion.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The rendezvous was explicitly aborted; every pending and future
    /// operation surfaces the first abort status.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A producer or consumer named a device this worker does not own,
    /// or named a stale incarnation of one it does.
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    /// A second send arrived for a key whose value is still buffered.
    /// One key carries one value in flight; the first value is left
    /// untouched.
    #[error("duplicate send for key {0}")]
    DuplicateSend(String),

    /// A second receive arrived for a key that already has a waiter.
    #[error("duplicate recv for key {0}")]
    DuplicateRecv(String),

    /// The operation requires an initialized rendezvous and deferral
    /// was not possible.
    #[error("rendezvous not initialized: {0}")]
    Uninitialized(String),
}

impl From<KeyParsingError> for TransferError {
    fn from(err: KeyParsingError) -> Self {
        TransferError::InvalidKey(err.to_string())
    }
}

/// A completed receive: the value, its deadness, and the transfer args
/// of both sides.
#[derive(Debug, Clone)]
pub struct RecvOk {
    /// The producer's transfer args.
    pub producer_args: TransferArgs,
    /// The consumer's transfer args, as passed to the receive.
    pub consumer_args: TransferArgs,
    /// The received value.
    pub value: TensorValue,
    /// Whether the producer marked the value dead.
    pub is_dead: bool,
}

/// The result of a pending or completed receive. Resolved by the
/// matching send, by an abort, or immediately when the value was
/// already buffered. Dropping the future abandons the receive; the
/// slot's waiter is completed into a closed channel, which is fine.
#[derive(Debug)]
pub struct RecvFuture {
    rx: oneshot::Receiver<Result<RecvOk, TransferError>>,
}

impl RecvFuture {
    pub(crate) fn ready(result: Result<RecvOk, TransferError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    pub(crate) fn pending() -> (oneshot::Sender<Result<RecvOk, TransferError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the calling thread until the receive completes. This is
    /// the one blocking entry point in the crate; it must not be called
    /// from an executor thread (it panics on a runtime worker, by way
    /// of [`oneshot::Receiver::blocking_recv`]).
    pub fn wait(self) -> Result<RecvOk, TransferError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(TransferError::Aborted("rendezvous dropped".to_string())),
        }
    }
}

impl Future for RecvFuture {
    type Output = Result<RecvOk, TransferError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|completed| match completed {
            Ok(result) => result,
            Err(_) => Err(TransferError::Aborted("rendezvous dropped".to_string())),
        })
    }
}

#[derive(Debug)]
struct Waiter {
    args: TransferArgs,
    tx: oneshot::Sender<Result<RecvOk, TransferError>>,
}

#[derive(Debug)]
enum Slot {
    /// A buffered value awaiting its consumer.
    Occupied(TensorItem),
    /// A registered receive awaiting its producer.
    Waiting(Waiter),
}

#[derive(Debug, Default)]
struct State {
    table: HashMap<RendezvousKey, Slot>,
    status: Option<TransferError>,
}

/// A process-local rendezvous table. See the module documentation for
/// the exchange contract.
#[derive(Debug, Default)]
pub struct LocalRendezvous {
    state: Mutex<State>,
}

impl LocalRendezvous {
    /// Create an empty rendezvous.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a value for `key`. Never blocks: completes a waiting
    /// receiver inline if one is registered, buffers otherwise.
    ///
    /// Fails with the stored abort status if the rendezvous was aborted
    /// (nothing is buffered in that case), and with
    /// [`TransferError::DuplicateSend`] if a value for `key` is already
    /// buffered.
    pub fn send(
        &self,
        key: RendezvousKey,
        args: TransferArgs,
        value: TensorValue,
        is_dead: bool,
    ) -> Result<(), TransferError> {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            if let Some(status) = &state.status {
                return Err(status.clone());
            }
            match state.table.entry(key) {
                Entry::Vacant(entry) => {
                    tracing::trace!(name = "send_buffered", key = %entry.key(), "buffering value");
                    entry.insert(Slot::Occupied(TensorItem {
                        value,
                        is_dead,
                        args,
                    }));
                    return Ok(());
                }
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Occupied(_) => {
                        return Err(TransferError::DuplicateSend(entry.key().to_string()));
                    }
                    Slot::Waiting(_) => {
                        tracing::trace!(
                            name = "send_matched",
                            key = %entry.key(),
                            "completing pending receive"
                        );
                        let (_, slot) = entry.remove_entry();
                        let Slot::Waiting(waiter) = slot else {
                            unreachable!("entry matched Waiting above");
                        };
                        waiter
                    }
                },
            }
        };
        // Complete the receiver outside the table lock.
        let _ = waiter.tx.send(Ok(RecvOk {
            producer_args: args,
            consumer_args: waiter.args,
            value,
            is_dead,
        }));
        Ok(())
    }

    /// Request the value for `key`. Never blocks the calling thread:
    /// returns a future that resolves immediately if a value is
    /// buffered (removing the slot), or when the matching send arrives.
    ///
    /// An aborted rendezvous resolves the future immediately with the
    /// stored status; a second receive on a key with a pending waiter
    /// resolves immediately with [`TransferError::DuplicateRecv`].
    pub fn recv(&self, key: RendezvousKey, args: TransferArgs) -> RecvFuture {
        let (tx, future) = RecvFuture::pending();
        self.recv_into(key, args, tx);
        future
    }

    /// [`recv`], completing into an existing channel. Used when the
    /// completion was handed out before routing was possible (deferred
    /// receives).
    ///
    /// [`recv`]: LocalRendezvous::recv
    pub(crate) fn recv_into(
        &self,
        key: RendezvousKey,
        args: TransferArgs,
        tx: oneshot::Sender<Result<RecvOk, TransferError>>,
    ) {
        let completed = {
            let mut state = self.state.lock().unwrap();
            if let Some(status) = &state.status {
                Err(status.clone())
            } else {
                match state.table.entry(key) {
                    Entry::Vacant(entry) => {
                        tracing::trace!(
                            name = "recv_pending",
                            key = %entry.key(),
                            "registering waiter"
                        );
                        entry.insert(Slot::Waiting(Waiter { args, tx }));
                        return;
                    }
                    Entry::Occupied(entry) => match entry.get() {
                        Slot::Waiting(_) => {
                            Err(TransferError::DuplicateRecv(entry.key().to_string()))
                        }
                        Slot::Occupied(_) => {
                            tracing::trace!(
                                name = "recv_matched",
                                key = %entry.key(),
                                "consuming buffered value"
                            );
                            let (_, slot) = entry.remove_entry();
                            let Slot::Occupied(item) = slot else {
                                unreachable!("entry matched Occupied above");
                            };
                            Ok(RecvOk {
                                producer_args: item.args,
                                consumer_args: args,
                                value: item.value,
                                is_dead: item.is_dead,
                            })
                        }
                    },
                }
            }
        };
        // Complete outside the table lock.
        let _ = tx.send(completed);
    }

    /// Mark the rendezvous permanently failed. The first status wins;
    /// subsequent aborts are no-ops. Every pending receive is completed
    /// with the status, buffered values are discarded, and all
    /// subsequent sends and receives fail fast with the same status.
    pub fn start_abort(&self, status: TransferError) {
        let drained: Vec<Waiter> = {
            let mut state = self.state.lock().unwrap();
            if state.status.is_some() {
                return;
            }
            tracing::debug!(name = "rendezvous_abort", status = %status, "aborting rendezvous");
            state.status = Some(status.clone());
            state
                .table
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Waiting(waiter) => Some(waiter),
                    Slot::Occupied(_) => None,
                })
                .collect()
        };
        for waiter in drained {
            let _ = waiter.tx.send(Err(status.clone()));
        }
    }

    /// The stored abort status, if the rendezvous was aborted.
    pub fn status(&self) -> Option<TransferError> {
        self.state.lock().unwrap().status.clone()
    }

    /// The number of unmatched slots (buffered values plus pending
    /// receives). Diagnostic only.
    pub fn num_pending(&self) -> usize {
        self.state.lock().unwrap().table.len()
    }
}
