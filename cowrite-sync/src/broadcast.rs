//! Room fan-out: deliver one member's update to every other member.
//!
//! Each document room owns one tokio broadcast channel. Every member holds
//! an independent [`Subscription`] buffering up to `capacity` frames, so a
//! slow member never stalls the sender or the other members. Frames are
//! tagged with their origin and the subscription of the origin skips them:
//! the sender gets no echo.
//!
//! Members are keyed by a member id the group mints on every join, never by
//! the client-supplied peer id: two connections presenting the same
//! [`PeerInfo`] are two members.
//!
//! The group itself lives inside the document session and is only mutated
//! under the document lock, which makes "apply, then broadcast" a single
//! step: every member observes updates in apply order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// One encoded frame plus the member it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Member id of the sender; `Uuid::nil()` for server-originated frames
    pub origin: Uuid,
    pub frame: Arc<Vec<u8>>,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    doc_id: Uuid,
    sender: broadcast::Sender<Envelope>,
    /// member id → display identity. The group tracks membership only;
    /// each member's connection owns its own lifetime.
    members: HashMap<Uuid, PeerInfo>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// `capacity` determines how many frames can be buffered per member
    /// before a lagging member starts missing frames.
    pub fn new(doc_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            doc_id,
            sender,
            members: HashMap::new(),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Attach a new member and announce it to the others.
    ///
    /// The returned subscription carries the freshly minted member id and
    /// sees every frame broadcast after this call. The full-state bootstrap
    /// is sent to the joiner directly, never through the group.
    pub fn join(&mut self, info: PeerInfo) -> Subscription {
        let member_id = Uuid::new_v4();
        let notice = SyncMessage::peer_joined(self.doc_id, &info);
        if let Err(e) = self.broadcast(member_id, &notice) {
            log::warn!("Failed to announce peer {} in {}: {e}", info.peer_id, self.doc_id);
        }
        self.members.insert(member_id, info);
        let receiver = self.sender.subscribe();

        Subscription {
            member_id,
            doc_id: self.doc_id,
            receiver,
            stats: self.stats.clone(),
        }
    }

    /// Detach a member and announce its departure to the others.
    pub fn leave(&mut self, member_id: &Uuid) -> Option<PeerInfo> {
        let removed = self.members.remove(member_id)?;
        let notice = SyncMessage::peer_left(removed.peer_id, self.doc_id);
        if let Err(e) = self.broadcast(*member_id, &notice) {
            log::warn!(
                "Failed to announce departure of {} in {}: {e}",
                removed.peer_id,
                self.doc_id
            );
        }
        Some(removed)
    }

    /// Forward an applied update to every member except the member `origin`.
    ///
    /// Must be called right after the update was merged, under the same
    /// document lock. Returns the number of subscriptions that got the frame
    /// (the origin's own included; it filters on receive).
    pub fn on_update(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        self.broadcast(origin, msg)
    }

    fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(origin, Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly.
    pub fn broadcast_raw(&self, origin: Uuid, frame: Arc<Vec<u8>>) -> usize {
        // No receivers is not an error: an empty room just drops the frame
        let count = self.sender.send(Envelope { origin, frame }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn peer_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.members.values().cloned().collect()
    }

    /// Display identity of a member.
    pub fn member(&self, member_id: &Uuid) -> Option<&PeerInfo> {
        self.members.get(member_id)
    }

    pub fn has_member(&self, member_id: &Uuid) -> bool {
        self.members.contains_key(member_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A member's view of its room.
pub struct Subscription {
    member_id: Uuid,
    doc_id: Uuid,
    receiver: broadcast::Receiver<Envelope>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    /// Next frame from another member, in broadcast order.
    ///
    /// `RecvError::Lagged(n)` means `n` frames were overwritten before this
    /// member read them; the caller must resynchronise from full state.
    pub async fn recv(&mut self) -> Result<Arc<Vec<u8>>, RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.origin == self.member_id => continue,
                Ok(envelope) => return Ok(envelope.frame),
                Err(RecvError::Lagged(n)) => {
                    self.stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
                    return Err(RecvError::Lagged(n));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Arc<Vec<u8>>, TryRecvError> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if envelope.origin == self.member_id => continue,
                Ok(envelope) => return Ok(envelope.frame),
                Err(TryRecvError::Lagged(n)) => {
                    self.stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
                    return Err(TryRecvError::Lagged(n));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Server-assigned id of this membership.
    pub fn member_id(&self) -> Uuid {
        self.member_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn decode(frame: &Arc<Vec<u8>>) -> SyncMessage {
        SyncMessage::decode(frame).unwrap()
    }

    #[tokio::test]
    async fn test_join_leave_membership() {
        let mut group = BroadcastGroup::new(Uuid::new_v4(), 16);
        let peer = PeerInfo::new("Alice");

        let sub = group.join(peer.clone());
        let member_id = sub.member_id();
        assert_eq!(group.peer_count(), 1);
        assert!(group.has_member(&member_id));
        assert_eq!(group.member(&member_id), Some(&peer));
        // The client-supplied id is display data, not a membership key
        assert!(!group.has_member(&peer.peer_id));

        assert_eq!(group.leave(&member_id), Some(peer));
        assert!(group.is_empty());
        assert!(group.leave(&member_id).is_none());
    }

    #[tokio::test]
    async fn test_same_identity_twice_is_two_members() {
        let doc = Uuid::new_v4();
        let mut group = BroadcastGroup::new(doc, 16);
        let peer = PeerInfo::new("Alice");

        let first = group.join(peer.clone());
        let mut second = group.join(peer.clone());
        assert_ne!(first.member_id(), second.member_id());
        assert_eq!(group.peer_count(), 2);

        // Frames from one membership reach the other one
        let msg = SyncMessage::update(peer.peer_id, doc, 1, vec![7]);
        group.on_update(first.member_id(), &msg).unwrap();
        let got = decode(&second.recv().await.unwrap());
        assert_eq!(got.msg_type, MessageType::Update);

        group.leave(&first.member_id());
        assert!(group.has_member(&second.member_id()));
        assert_eq!(group.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_update_reaches_others_not_origin() {
        let doc = Uuid::new_v4();
        let mut group = BroadcastGroup::new(doc, 16);
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");

        let mut rx_alice = group.join(alice.clone());
        let mut rx_bob = group.join(bob.clone());

        // Alice sees Bob's join notice; Bob sees nothing about himself
        assert_eq!(decode(&rx_alice.recv().await.unwrap()).msg_type, MessageType::PeerJoined);

        let msg = SyncMessage::update(alice.peer_id, doc, 1, vec![1, 2, 3]);
        group.on_update(rx_alice.member_id(), &msg).unwrap();

        let got = decode(&rx_bob.recv().await.unwrap());
        assert_eq!(got.msg_type, MessageType::Update);
        assert_eq!(got.payload, vec![1, 2, 3]);

        assert!(matches!(rx_alice.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_order_is_identical_for_all_members() {
        let doc = Uuid::new_v4();
        let mut group = BroadcastGroup::new(doc, 64);
        let origin = PeerInfo::new("Origin");
        let mut subs: Vec<_> = (0..3).map(|i| group.join(PeerInfo::new(format!("P{i}")))).collect();
        let origin_sub = group.join(origin.clone());

        for seq in 1..=10u64 {
            let msg = SyncMessage::update(origin.peer_id, doc, seq, vec![seq as u8]);
            group.on_update(origin_sub.member_id(), &msg).unwrap();
        }

        for sub in subs.iter_mut() {
            let mut seen = Vec::new();
            while let Ok(frame) = sub.try_recv() {
                let msg = decode(&frame);
                if msg.msg_type == MessageType::Update {
                    seen.push(msg.seq);
                }
            }
            assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_leave_notice_reaches_remaining() {
        let doc = Uuid::new_v4();
        let mut group = BroadcastGroup::new(doc, 16);
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        let mut rx_alice = group.join(alice);
        let rx_bob = group.join(bob.clone());
        let _ = rx_alice.recv().await.unwrap(); // Bob joined

        group.leave(&rx_bob.member_id());
        let notice = decode(&rx_alice.recv().await.unwrap());
        assert_eq!(notice.msg_type, MessageType::PeerLeft);
        assert_eq!(notice.peer_id, bob.peer_id);
    }

    #[tokio::test]
    async fn test_dropped_subscription_does_not_block_others() {
        let doc = Uuid::new_v4();
        let mut group = BroadcastGroup::new(doc, 16);
        let gone = PeerInfo::new("Gone");
        let stays = PeerInfo::new("Stays");
        let sub_gone = group.join(gone);
        let mut sub_stays = group.join(stays);
        drop(sub_gone);

        let count = group.broadcast_raw(Uuid::nil(), Arc::new(vec![9]));
        assert_eq!(count, 1);
        assert_eq!(*sub_stays.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_lagging_member_is_told() {
        let doc = Uuid::new_v4();
        let mut group = BroadcastGroup::new(doc, 2);
        let mut slow = group.join(PeerInfo::new("Slow"));

        // 5 frames into a 2-slot buffer: the oldest 3 are overwritten
        for i in 0..5u8 {
            group.broadcast_raw(Uuid::nil(), Arc::new(vec![i]));
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(group.stats().messages_lagged, 3);
        // After the lag report the newest frames are still readable
        assert_eq!(*slow.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let mut group = BroadcastGroup::new(Uuid::new_v4(), 16);
        let _rx = group.join(PeerInfo::new("Alice"));
        group.broadcast_raw(Uuid::nil(), Arc::new(vec![1]));

        let stats = group.stats();
        // join notice + raw frame
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }
}
