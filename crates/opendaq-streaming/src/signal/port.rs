// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Input ports: the queue between a signal and its consumer.

use std::sync::Weak;

use crossbeam::queue::SegQueue;
use parking_lot::RwLock;

use super::packet::Packet;

/// Receives "packet ready" notifications.
pub trait PortListener: Send + Sync {
    fn packet_received(&self, port: &InputPort);
}

/// How the listener is told about new packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketReadyNotification {
    /// Listener runs on the thread that enqueued the packet.
    #[default]
    SameThread,
    /// Consumer polls the queue itself.
    None,
}

/// Packet queue with an optional listener.
pub struct InputPort {
    queue: SegQueue<Packet>,
    listener: RwLock<Option<Weak<dyn PortListener>>>,
    notification: PacketReadyNotification,
}

impl InputPort {
    pub fn new(notification: PacketReadyNotification) -> Self {
        Self {
            queue: SegQueue::new(),
            listener: RwLock::new(None),
            notification,
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn PortListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    pub fn enqueue(&self, packet: Packet) {
        self.queue.push(packet);
        if self.notification == PacketReadyNotification::SameThread {
            let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
            if let Some(listener) = listener {
                listener.packet_received(self);
            }
        }
    }

    pub fn dequeue(&self) -> Option<Packet> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("queued", &self.queue.len())
            .field("notification", &self.notification)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{DataDescriptor, DataPacket, SampleType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Drain {
        seen: AtomicUsize,
    }

    impl PortListener for Drain {
        fn packet_received(&self, port: &InputPort) {
            while port.dequeue().is_some() {
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn packet() -> Packet {
        let desc = Arc::new(DataDescriptor::new(SampleType::Float64));
        DataPacket::from_samples(desc, &[1.0f64]).into()
    }

    #[test]
    fn test_same_thread_notification_drains() {
        let port = InputPort::new(PacketReadyNotification::SameThread);
        let drain = Arc::new(Drain {
            seen: AtomicUsize::new(0),
        });
        let weak: Weak<dyn PortListener> = Arc::downgrade(&drain) as Weak<dyn PortListener>;
        port.set_listener(weak);

        port.enqueue(packet());
        port.enqueue(packet());
        assert_eq!(drain.seen.load(Ordering::SeqCst), 2);
        assert!(port.is_empty());
    }

    #[test]
    fn test_no_notification_queues() {
        let port = InputPort::new(PacketReadyNotification::None);
        port.enqueue(packet());
        assert_eq!(port.len(), 1);
        assert!(port.dequeue().is_some());
        assert!(port.dequeue().is_none());
    }

    #[test]
    fn test_dropped_listener_is_ignored() {
        let port = InputPort::new(PacketReadyNotification::SameThread);
        {
            let drain = Arc::new(Drain {
                seen: AtomicUsize::new(0),
            });
            port.set_listener(Arc::downgrade(&drain) as Weak<dyn PortListener>);
        }
        port.enqueue(packet());
        assert_eq!(port.len(), 1);
    }
}
