// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-address cancellable operations.

use bluer::Address;
use std::collections::HashMap;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identifies one started operation. Reports carry it so the owner can
/// drop results from operations that were replaced in the meantime.
pub(crate) type OpId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    /// Bonding phase of a connection attempt.
    Connect,
    /// Profile connection watchdog.
    Profile,
    /// OBD2 handshake and polling loop.
    Obd,
    /// Profile disconnect and bond removal.
    Release,
}

#[derive(Debug)]
struct PendingOp {
    id: OpId,
    kind: OpKind,
    token: CancellationToken,
}

/// At most one live operation per address.
///
/// Starting an operation cancels the previous one for the same address
/// before the new task is spawned.
#[derive(Debug, Default)]
pub(crate) struct PendingOps {
    ops: HashMap<Address, PendingOp>,
    next_id: OpId,
}

impl PendingOps {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` as the live operation for `address`.
    pub(crate) fn start<F, Fut>(&mut self, address: Address, kind: OpKind, task: F) -> OpId
    where
        F: FnOnce(OpId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(&address);

        self.next_id += 1;
        let id = self.next_id;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let fut = task(id);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = fut => {}
            }
        });

        debug!("Started {:?} operation #{} for {}", kind, id, address);
        self.ops.insert(address, PendingOp { id, kind, token });
        id
    }

    /// Cancel the live operation for `address`, if any.
    pub(crate) fn cancel(&mut self, address: &Address) -> bool {
        match self.ops.remove(address) {
            Some(op) => {
                debug!("Cancelled {:?} operation #{} for {}", op.kind, op.id, address);
                op.token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (address, op) in self.ops.drain() {
            debug!("Cancelled {:?} operation #{} for {}", op.kind, op.id, address);
            op.token.cancel();
        }
    }

    /// Whether `id` is still the live operation for `address`.
    pub(crate) fn is_current(&self, address: &Address, id: OpId) -> bool {
        self.ops.get(address).is_some_and(|op| op.id == id)
    }

    pub(crate) fn kind_of(&self, address: &Address) -> Option<OpKind> {
        self.ops.get(address).map(|op| op.kind)
    }

    /// Forget a completed operation. No-op if it was already replaced.
    pub(crate) fn finish(&mut self, address: &Address, id: OpId) {
        if self.is_current(address, id) {
            self.ops.remove(address);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn addr(last: u8) -> Address {
        Address::new([0, 0, 0, 0, 0, last])
    }

    #[tokio::test]
    async fn test_start_cancels_previous() {
        let mut ops = PendingOps::new();
        let (first_tx, first_rx) = oneshot::channel::<()>();
        let (second_tx, second_rx) = oneshot::channel::<()>();

        let first = ops.start(addr(1), OpKind::Connect, move |_| async move {
            std::future::pending::<()>().await;
            let _ = first_tx.send(());
        });
        let second = ops.start(addr(1), OpKind::Profile, move |_| async move {
            let _ = second_tx.send(());
        });

        // The first task is dropped without ever sending.
        assert!(first_rx.await.is_err());
        assert!(second_rx.await.is_ok());

        assert_eq!(ops.len(), 1);
        assert!(!ops.is_current(&addr(1), first));
        assert!(ops.is_current(&addr(1), second));
        assert_eq!(ops.kind_of(&addr(1)), Some(OpKind::Profile));
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let mut ops = PendingOps::new();
        let a = ops.start(addr(1), OpKind::Obd, |_| std::future::pending::<()>());
        let b = ops.start(addr(2), OpKind::Obd, |_| std::future::pending::<()>());

        assert_eq!(ops.len(), 2);
        assert!(ops.is_current(&addr(1), a));
        assert!(ops.is_current(&addr(2), b));

        assert!(ops.cancel(&addr(1)));
        assert!(!ops.cancel(&addr(1)));
        assert!(ops.is_current(&addr(2), b));
    }

    #[tokio::test]
    async fn test_finish_ignores_replaced_operation() {
        let mut ops = PendingOps::new();
        let old = ops.start(addr(1), OpKind::Connect, |_| async {});
        let new = ops.start(addr(1), OpKind::Connect, |_| async {});

        ops.finish(&addr(1), old);
        assert!(ops.is_current(&addr(1), new));

        ops.finish(&addr(1), new);
        assert_eq!(ops.kind_of(&addr(1)), None);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let mut ops = PendingOps::new();
        let (tx, rx) = oneshot::channel::<()>();
        ops.start(addr(1), OpKind::Obd, move |_| async move {
            std::future::pending::<()>().await;
            let _ = tx.send(());
        });
        ops.start(addr(2), OpKind::Release, |_| std::future::pending::<()>());

        ops.cancel_all();
        assert_eq!(ops.len(), 0);
        assert!(rx.await.is_err());
    }
}
