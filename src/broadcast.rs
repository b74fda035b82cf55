// Transmit-limited broadcast queue
//
// Pending gossip messages ordered by how often they have already been sent:
// fresh rumors spread first, and every message is dropped once it has been
// transmitted `ceil(retransmit_mult * log10(N + 1))` times. A newer rumor
// about the same node evicts the older one. The queue takes a node-count
// supplier instead of a table reference so it has no view of the rest of
// the core.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Supplier of the current cluster size estimate.
pub type NodeCountFn = Arc<dyn Fn() -> usize + Send + Sync>;

/// Number of transmissions after which a broadcast is retired.
pub fn retransmit_limit(retransmit_mult: u32, num_nodes: usize) -> u32 {
    let scale = ((num_nodes.max(1) + 1) as f64).log10();
    (retransmit_mult as f64 * scale).ceil() as u32
}

struct QueuedBroadcast {
    /// Dedup tag; a newer broadcast for the same name evicts the older
    name: Option<String>,
    payload: Bytes,
    transmits: u32,
    /// Insertion order, breaks transmit-count ties FIFO
    id: u64,
    /// Fired when the broadcast leaves the queue
    notify: Option<oneshot::Sender<()>>,
}

impl QueuedBroadcast {
    fn finish(&mut self) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(());
        }
    }
}

pub struct TransmitLimitedQueue {
    retransmit_mult: u32,
    num_nodes: NodeCountFn,
    queue: Mutex<Vec<QueuedBroadcast>>,
    id_gen: AtomicU64,
}

impl TransmitLimitedQueue {
    pub fn new(retransmit_mult: u32, num_nodes: NodeCountFn) -> Self {
        Self {
            retransmit_mult,
            num_nodes,
            queue: Mutex::new(Vec::new()),
            id_gen: AtomicU64::new(0),
        }
    }

    /// Enqueue a broadcast. An existing entry with the same `name` is
    /// replaced and its notify signal fired.
    pub fn queue_broadcast(
        &self,
        name: Option<String>,
        payload: Bytes,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let mut queue = self.queue.lock();

        if let Some(tag) = &name {
            if let Some(pos) = queue
                .iter()
                .position(|b| b.name.as_deref() == Some(tag.as_str()))
            {
                let mut old = queue.remove(pos);
                old.finish();
            }
        }

        queue.push(QueuedBroadcast {
            name,
            payload,
            transmits: 0,
            id: self.id_gen.fetch_add(1, Ordering::Relaxed),
            notify,
        });
    }

    /// Pull up to `limit` bytes of broadcasts, `overhead` bytes of framing
    /// per message. Least-transmitted messages first; each returned message
    /// has its transmit counter bumped and is retired once it hits the
    /// retransmit limit.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Vec::new();
        }

        let transmit_limit = retransmit_limit(self.retransmit_mult, (self.num_nodes)());
        queue.sort_by_key(|b| (b.transmits, b.id));

        let mut used = 0usize;
        let mut out = Vec::new();
        let mut retired = Vec::new();

        for (idx, broadcast) in queue.iter_mut().enumerate() {
            let cost = overhead + broadcast.payload.len();
            if used + cost > limit {
                continue;
            }
            used += cost;
            out.push(broadcast.payload.clone());
            broadcast.transmits += 1;
            if broadcast.transmits >= transmit_limit {
                retired.push(idx);
            }
        }

        for idx in retired.into_iter().rev() {
            let mut done = queue.remove(idx);
            done.finish();
        }

        out
    }

    pub fn num_queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop everything, firing pending notify signals. Used on shutdown.
    pub fn reset(&self) {
        let mut queue = self.queue.lock();
        for broadcast in queue.iter_mut() {
            broadcast.finish();
        }
        queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_nodes(n: usize) -> NodeCountFn {
        Arc::new(move || n)
    }

    #[test]
    fn test_retransmit_limit_formula() {
        // N=10, mult=4: ceil(4 * log10(11)) = 5
        assert_eq!(retransmit_limit(4, 10), 5);
        // N=1, mult=4: ceil(4 * log10(2)) = 2
        assert_eq!(retransmit_limit(4, 1), 2);
        // N=0 treated as 1
        assert_eq!(retransmit_limit(4, 0), 2);
    }

    #[test]
    fn test_priority_and_fifo_ordering() {
        let queue = TransmitLimitedQueue::new(4, fixed_nodes(100));
        queue.queue_broadcast(None, Bytes::from_static(b"first"), None);
        queue.queue_broadcast(None, Bytes::from_static(b"second"), None);

        // Both at zero transmits: FIFO
        let out = queue.get_broadcasts(0, 5);
        assert_eq!(out, vec![Bytes::from_static(b"first")]);

        // "second" still at zero transmits now outranks "first"
        let out = queue.get_broadcasts(0, 1024);
        assert_eq!(out[0], Bytes::from_static(b"second"));
        assert_eq!(out[1], Bytes::from_static(b"first"));
    }

    #[test]
    fn test_name_eviction() {
        let queue = TransmitLimitedQueue::new(4, fixed_nodes(10));
        let (tx, mut rx) = oneshot::channel();
        queue.queue_broadcast(Some("node1".to_string()), Bytes::from_static(b"old"), Some(tx));
        queue.queue_broadcast(Some("node1".to_string()), Bytes::from_static(b"new"), None);

        assert_eq!(queue.num_queued(), 1);
        // The evicted broadcast signals completion
        assert!(rx.try_recv().is_ok());

        let out = queue.get_broadcasts(0, 1024);
        assert_eq!(out, vec![Bytes::from_static(b"new")]);
    }

    #[test]
    fn test_transmit_limit_retires_message() {
        // N=10, mult=4: the message must appear in exactly 5 drains
        let queue = TransmitLimitedQueue::new(4, fixed_nodes(10));
        let (tx, mut rx) = oneshot::channel();
        queue.queue_broadcast(Some("node1".to_string()), Bytes::from_static(b"rumor"), Some(tx));

        for _ in 0..5 {
            let out = queue.get_broadcasts(0, 1024);
            assert_eq!(out.len(), 1);
        }
        assert_eq!(queue.num_queued(), 0);
        assert!(rx.try_recv().is_ok());
        assert!(queue.get_broadcasts(0, 1024).is_empty());
    }

    #[test]
    fn test_size_budget() {
        let queue = TransmitLimitedQueue::new(4, fixed_nodes(10));
        queue.queue_broadcast(None, Bytes::from(vec![0u8; 100]), None);
        queue.queue_broadcast(None, Bytes::from(vec![1u8; 100]), None);

        // Budget only fits one message including its overhead
        let out = queue.get_broadcasts(2, 110);
        assert_eq!(out.len(), 1);

        // Nothing fits
        let out = queue.get_broadcasts(2, 50);
        assert!(out.is_empty());
    }

    #[test]
    fn test_reset_fires_notify() {
        let queue = TransmitLimitedQueue::new(4, fixed_nodes(10));
        let (tx, mut rx) = oneshot::channel();
        queue.queue_broadcast(Some("a".to_string()), Bytes::from_static(b"x"), Some(tx));
        queue.reset();
        assert_eq!(queue.num_queued(), 0);
        assert!(rx.try_recv().is_ok());
    }
}
