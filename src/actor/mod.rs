//! Cooperative single-owner actor runtime (§4.6).
//!
//! Mirrors the driver/handle split used for Raft consensus: a private
//! "driver" owns all actor-local state and runs its message loop on its own
//! `tokio` task; a public, `Clone + Send + Sync` handle holds only the
//! `mpsc` sender plus any state callers need to poll synchronously. Because
//! the driver alone holds the receiving end, at most one message executes
//! at a time and messages from one sender are always applied in the order
//! they were posted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Activity level reported by an actor, polled without a channel round
/// trip via an `AtomicU8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityLevel {
    Stopped,
    Idle,
    Connecting,
    Busy,
}

const LEVEL_STOPPED: u8 = 0;
const LEVEL_IDLE: u8 = 1;
const LEVEL_CONNECTING: u8 = 2;
const LEVEL_BUSY: u8 = 3;

impl ActivityLevel {
    fn to_u8(self) -> u8 {
        match self {
            ActivityLevel::Stopped => LEVEL_STOPPED,
            ActivityLevel::Idle => LEVEL_IDLE,
            ActivityLevel::Connecting => LEVEL_CONNECTING,
            ActivityLevel::Busy => LEVEL_BUSY,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            LEVEL_IDLE => ActivityLevel::Idle,
            LEVEL_CONNECTING => ActivityLevel::Connecting,
            LEVEL_BUSY => ActivityLevel::Busy,
            _ => ActivityLevel::Stopped,
        }
    }
}

/// Shared, lock-free activity-level cell. Embedded in both a driver and its
/// handle(s) so reads never cross the mailbox.
#[derive(Clone)]
pub struct ActivityCell(Arc<AtomicU8>);

impl ActivityCell {
    pub fn new(initial: ActivityLevel) -> Self {
        Self(Arc::new(AtomicU8::new(initial.to_u8())))
    }

    pub fn get(&self) -> ActivityLevel {
        ActivityLevel::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, level: ActivityLevel) {
        self.0.store(level.to_u8(), Ordering::Release);
    }
}

/// Generic mailbox pair for an actor whose message type is `Msg`. Build a
/// domain actor by pairing a `Mailbox<Msg>::channel()` sender with a
/// `Msg`-specific handle type, and draining the receiver in a
/// `tokio::spawn`ed loop that calls a `handle_one(msg)` method per message.
pub struct Mailbox<Msg> {
    pub tx: mpsc::UnboundedSender<Msg>,
    pub rx: mpsc::UnboundedReceiver<Msg>,
}

impl<Msg> Mailbox<Msg> {
    pub fn channel() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

/// A request/response envelope: a fire-and-forget `post` becomes a `call`
/// simply by embedding one of these in the message variant.
pub struct Reply<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Reply<T> {
    pub fn pair() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Delivers the result. Silently dropped if the caller already gave up
    /// on the receiver — matches the teacher's `let _ = tx.send(...)`
    /// fire-and-forget discard for cancelled callers.
    pub fn send(self, value: T) {
        let _ = self.tx.send(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Msg {
        Ping(Reply<u32>),
    }

    #[tokio::test]
    async fn mailbox_roundtrips_a_call() {
        let Mailbox { tx, mut rx } = Mailbox::channel();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Ping(reply) => reply.send(42),
                }
            }
        });

        let (reply, rx) = Reply::pair();
        tx.send(Msg::Ping(reply)).unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[test]
    fn activity_cell_round_trips_all_levels() {
        let cell = ActivityCell::new(ActivityLevel::Stopped);
        for level in [
            ActivityLevel::Idle,
            ActivityLevel::Connecting,
            ActivityLevel::Busy,
            ActivityLevel::Stopped,
        ] {
            cell.set(level);
            assert_eq!(cell.get(), level);
        }
    }
}
