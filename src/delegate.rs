// User callback surface
//
// The membership core is payload-agnostic: applications hook in through
// `Delegate` (metadata, user gossip, anti-entropy state) and `EventDelegate`
// (membership change notifications). Callbacks may be invoked concurrently
// from any protocol task and must not block.

use crate::node::Member;

/// Application hooks for piggybacking data on the gossip layer.
///
/// All methods have no-op defaults so implementors only override what they
/// use.
pub trait Delegate: Send + Sync {
    /// Metadata to attach to this node's alive messages. Must not exceed
    /// `limit` bytes; violating the limit is a fatal contract breach.
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// A user message arrived over the gossip layer. The buffer is only
    /// valid for the duration of the call.
    fn notify_msg(&self, _msg: &[u8]) {}

    /// User messages to piggyback on the next gossip datagram. Each entry
    /// costs `overhead` bytes of framing; the total must fit in `limit`.
    fn broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Opaque local state for a push/pull exchange; `join` marks the
    /// initial sync after a join.
    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Merge state received from a remote push/pull exchange.
    fn merge_remote_state(&self, _state: &[u8], _join: bool) {}
}

/// Membership change notifications.
pub trait EventDelegate: Send + Sync {
    /// A node was added to the live view
    fn notify_join(&self, _member: &Member) {}

    /// A live node's metadata or address changed
    fn notify_update(&self, _member: &Member) {}

    /// A node left the live view (failed or departed)
    fn notify_leave(&self, _member: &Member) {}
}

/// Delegate that does nothing, used when no delegate is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {}
impl EventDelegate for NoopDelegate {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_delegate_defaults() {
        let delegate = NoopDelegate;
        assert!(delegate.node_meta(512).is_empty());
        assert!(delegate.broadcasts(2, 1400).is_empty());
        assert!(delegate.local_state(false).is_empty());
        delegate.notify_msg(b"ignored");
        delegate.merge_remote_state(b"ignored", true);
    }
}
