//! Request/response correlation over a fire-and-forget message stream.
//!
//! Two tables of single-resolution slots:
//! - acks: key → FIFO queue, one slot popped per COMMAND_ACK
//! - messages: key → set, every slot resolved by the next matching message
//!
//! Slots are removed the moment they resolve. Slots whose waiter gave up
//! are skipped on resolution and pruned on the next registration.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;

use super::RelayError;
use crate::protocol::Frame;

/// Matches a COMMAND_ACK to the COMMAND_LONG that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub command: u32,
    pub vehicle_system: u8,
    pub target_component: u8,
    pub operator_system: u8,
    pub operator_component: u8,
}

/// Matches an incoming message to listeners for that id and sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub msg_id: u32,
    pub system: u8,
    pub component: u8,
}

#[derive(Debug, Default)]
pub struct CorrelationTables {
    acks: HashMap<AckKey, VecDeque<oneshot::Sender<bool>>>,
    messages: HashMap<MessageKey, Vec<oneshot::Sender<Frame>>>,
}

impl CorrelationTables {
    pub fn register_ack(&mut self, key: AckKey) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let queue = self.acks.entry(key).or_default();
        queue.retain(|slot| !slot.is_closed());
        queue.push_back(tx);
        rx
    }

    /// Resolve the oldest live waiter for `key`. Returns false when nobody
    /// was waiting.
    pub fn resolve_ack(&mut self, key: &AckKey, accepted: bool) -> bool {
        let Some(queue) = self.acks.get_mut(key) else {
            return false;
        };
        let mut resolved = false;
        while let Some(slot) = queue.pop_front() {
            if slot.send(accepted).is_ok() {
                resolved = true;
                break;
            }
        }
        if queue.is_empty() {
            self.acks.remove(key);
        }
        resolved
    }

    pub fn register_message(&mut self, key: MessageKey) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        let slots = self.messages.entry(key).or_default();
        slots.retain(|slot| !slot.is_closed());
        slots.push(tx);
        rx
    }

    /// Resolve every waiter for `key` with `frame`. Returns how many were
    /// still listening.
    pub fn resolve_messages(&mut self, key: &MessageKey, frame: &Frame) -> usize {
        self.messages.remove(key).map_or(0, |slots| {
            slots
                .into_iter()
                .filter(|slot| !slot.is_closed())
                .map(|slot| slot.send(frame.clone()).is_ok())
                .filter(|delivered| *delivered)
                .count()
        })
    }

    pub fn pending_acks(&self, key: &AckKey) -> usize {
        self.acks.get(key).map_or(0, VecDeque::len)
    }

    pub fn pending_messages(&self, key: &MessageKey) -> usize {
        self.messages.get(key).map_or(0, Vec::len)
    }

    /// Drop every slot; their waiters observe the relay as stopped.
    pub fn clear(&mut self) {
        self.acks.clear();
        self.messages.clear();
    }
}

/// Resolves to whether the vehicle accepted the command.
#[derive(Debug)]
pub struct AckWaiter {
    key: AckKey,
    rx: oneshot::Receiver<bool>,
}

impl AckWaiter {
    pub(crate) fn new(key: AckKey, rx: oneshot::Receiver<bool>) -> Self {
        Self { key, rx }
    }

    pub fn key(&self) -> AckKey {
        self.key
    }

    pub async fn wait(self, timeout: Duration) -> Result<bool, RelayError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(_)) => Err(RelayError::Stopped),
            Err(_) => Err(RelayError::RequestTimeout {
                what: format!("ack for command {}", self.key.command),
                timeout,
            }),
        }
    }
}

/// Resolves to the next matching message.
#[derive(Debug)]
pub struct MessageWaiter {
    key: MessageKey,
    rx: oneshot::Receiver<Frame>,
}

impl MessageWaiter {
    pub(crate) fn new(key: MessageKey, rx: oneshot::Receiver<Frame>) -> Self {
        Self { key, rx }
    }

    pub fn key(&self) -> MessageKey {
        self.key
    }

    pub async fn wait(self, timeout: Duration) -> Result<Frame, RelayError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(RelayError::Stopped),
            Err(_) => Err(RelayError::RequestTimeout {
                what: format!("message {}", self.key.msg_id),
                timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{relay_heartbeat, Identity};

    fn ack_key() -> AckKey {
        AckKey {
            command: 400,
            vehicle_system: 1,
            target_component: 1,
            operator_system: 246,
            operator_component: 190,
        }
    }

    #[test]
    fn test_acks_resolve_oldest_first() {
        let mut tables = CorrelationTables::default();
        let key = ack_key();
        let mut first = tables.register_ack(key);
        let mut second = tables.register_ack(key);
        let mut third = tables.register_ack(key);

        assert!(tables.resolve_ack(&key, false));
        assert_eq!(first.try_recv(), Ok(false));
        assert!(second.try_recv().is_err(), "second still pending");

        assert!(tables.resolve_ack(&key, true));
        assert!(tables.resolve_ack(&key, true));
        assert_eq!(second.try_recv(), Ok(true));
        assert_eq!(third.try_recv(), Ok(true));

        assert!(!tables.resolve_ack(&key, true), "queue drained");
        assert_eq!(tables.pending_acks(&key), 0);
    }

    #[test]
    fn test_abandoned_ack_waiter_is_skipped() {
        let mut tables = CorrelationTables::default();
        let key = ack_key();
        let gone = tables.register_ack(key);
        let mut live = tables.register_ack(key);
        drop(gone);

        assert!(tables.resolve_ack(&key, true));
        assert_eq!(live.try_recv(), Ok(true));
    }

    #[test]
    fn test_registration_prunes_closed_slots() {
        let mut tables = CorrelationTables::default();
        let key = ack_key();
        for _ in 0..5 {
            drop(tables.register_ack(key));
        }
        let _live = tables.register_ack(key);
        assert_eq!(tables.pending_acks(&key), 1);
    }

    #[test]
    fn test_message_waiters_all_resolve() {
        let mut tables = CorrelationTables::default();
        let key = MessageKey {
            msg_id: 0,
            system: 1,
            component: 1,
        };
        let mut a = tables.register_message(key);
        let mut b = tables.register_message(key);
        let frame = Frame::new(Identity::new(1, 1), relay_heartbeat());

        assert_eq!(tables.resolve_messages(&key, &frame), 2);
        assert_eq!(a.try_recv().unwrap().source(), Identity::new(1, 1));
        assert!(b.try_recv().is_ok());
        assert_eq!(tables.pending_messages(&key), 0);
        assert_eq!(tables.resolve_messages(&key, &frame), 0);
    }

    #[tokio::test]
    async fn test_waiter_timeout_and_stop() {
        let mut tables = CorrelationTables::default();
        let key = ack_key();
        let waiter = AckWaiter::new(key, tables.register_ack(key));
        let err = waiter.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());

        let waiter = AckWaiter::new(key, tables.register_ack(key));
        tables.clear();
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(RelayError::Stopped)
        ));
    }
}
