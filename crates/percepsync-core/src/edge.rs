//! Producer-to-synchronizer edges with a static delivery policy.
//!
//! An edge has exactly one producer and one consumer. The producer
//! never blocks: depending on the [DeliveryPolicy] a push either
//! overwrites the pending message or appends to the queue.

use crate::config::DeliveryPolicy;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Outcome of [EdgeSender::push].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The message overwrote an unconsumed one.
    Replaced,
    /// The consumer is gone and the message was discarded.
    Disconnected,
}

#[derive(Debug)]
struct Shared<T> {
    policy: DeliveryPolicy,
    queue: Mutex<VecDeque<T>>,
    replaced: AtomicU64,
    sender_closed: AtomicBool,
    receiver_closed: AtomicBool,
}

/// Creates an edge with the given policy.
pub fn edge<T>(policy: DeliveryPolicy) -> (EdgeSender<T>, EdgeReceiver<T>) {
    let shared = Arc::new(Shared {
        policy,
        queue: Mutex::new(VecDeque::new()),
        replaced: AtomicU64::new(0),
        sender_closed: AtomicBool::new(false),
        receiver_closed: AtomicBool::new(false),
    });

    (
        EdgeSender {
            shared: shared.clone(),
        },
        EdgeReceiver { shared },
    )
}

#[derive(Debug)]
pub struct EdgeSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EdgeSender<T> {
    pub fn push(&self, message: T) -> Delivery {
        if self.shared.receiver_closed.load(Ordering::Acquire) {
            return Delivery::Disconnected;
        }

        let mut queue = self.shared.queue.lock();
        match self.shared.policy {
            DeliveryPolicy::LatestOnly => {
                let replaced = queue.pop_front().is_some();
                queue.push_back(message);
                if replaced {
                    self.shared.replaced.fetch_add(1, Ordering::Relaxed);
                    Delivery::Replaced
                } else {
                    Delivery::Queued
                }
            }
            DeliveryPolicy::Unlimited => {
                queue.push_back(message);
                Delivery::Queued
            }
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.shared.policy
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.receiver_closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for EdgeSender<T> {
    fn drop(&mut self) {
        self.shared.sender_closed.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct EdgeReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EdgeReceiver<T> {
    /// Takes every pending message in arrival order.
    pub fn drain(&self) -> Vec<T> {
        self.shared.queue.lock().drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether the producer is gone. Pending messages may remain.
    pub fn is_closed(&self) -> bool {
        self.shared.sender_closed.load(Ordering::Acquire)
    }

    pub fn monitor(&self) -> EdgeMonitor<T> {
        EdgeMonitor {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for EdgeReceiver<T> {
    fn drop(&mut self) {
        self.shared.receiver_closed.store(true, Ordering::Release);
    }
}

/// Inspects an edge from outside the producer and consumer.
#[derive(Debug)]
pub struct EdgeMonitor<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EdgeMonitor<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> EdgeMonitor<T> {
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Number of messages lost to overwrites so far.
    pub fn replaced(&self) -> u64 {
        self.shared.replaced.load(Ordering::Relaxed)
    }

    /// Drops every pending message and returns how many there were.
    pub fn discard(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        let count = queue.len();
        queue.clear();
        count
    }
}

/// Type-erased handle used to discard the pending messages of an edge.
pub trait Discard: Send + Sync {
    fn discard(&self) -> usize;
}

impl<T> Discard for EdgeMonitor<T>
where
    T: Send,
{
    fn discard(&self) -> usize {
        EdgeMonitor::discard(self)
    }
}
