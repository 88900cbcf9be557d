use tokio::sync::{mpsc, watch};

use crate::types::InvalidationSignal;

/// Latest-value observer channel used for auth and resource state.
///
/// Observers register by calling [`StateChannel::subscribe`] and deregister
/// by dropping the receiver.
#[derive(Debug)]
pub struct StateChannel<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> StateChannel<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Current value.
    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify observers.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Modify the value in place and notify observers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Modify the value in place; observers are notified only when `f`
    /// returns `true`.
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Create a merged invalidation channel.
pub fn signal_channel(buffer: usize) -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (SignalSender { tx }, SignalReceiver { rx })
}

/// Producer half handed to every signal source of one resource key.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<InvalidationSignal>,
}

impl SignalSender {
    /// Forward one signal. Returns `false` once the receiver is gone.
    ///
    /// A full buffer drops the signal; the pending ones already cover it.
    pub fn forward(&self, signal: InvalidationSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer half that coalesces bursts into one trigger.
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::Receiver<InvalidationSignal>,
}

impl SignalReceiver {
    /// Wait for the next signal and swallow everything already queued behind it.
    ///
    /// Returns the first signal and the number of signals it absorbed.
    pub async fn recv_coalesced(&mut self) -> Option<(InvalidationSignal, usize)> {
        let first = self.rx.recv().await?;
        let mut absorbed = 0;
        while self.rx.try_recv().is_ok() {
            absorbed += 1;
        }
        Some((first, absorbed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceKey, SignalKind};

    fn signal(kind: SignalKind) -> InvalidationSignal {
        InvalidationSignal {
            kind,
            key: ResourceKey::from("t-1"),
        }
    }

    #[tokio::test]
    async fn fans_out_latest_state_to_observers() {
        let channel = StateChannel::new(0_u32);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.observer_count(), 2);

        channel.publish(7);
        a.changed().await.expect("observer a should see change");
        b.changed().await.expect("observer b should see change");
        assert_eq!(*a.borrow(), 7);
        assert_eq!(*b.borrow(), 7);

        drop(b);
        assert_eq!(channel.observer_count(), 1);
    }

    #[tokio::test]
    async fn update_modifies_in_place() {
        let channel = StateChannel::new(vec![1]);
        channel.update(|items| items.push(2));
        assert_eq!(channel.current(), vec![1, 2]);
    }

    #[tokio::test]
    async fn coalesces_queued_signals() {
        let (tx, mut rx) = signal_channel(8);
        assert!(tx.forward(signal(SignalKind::Focus)));
        assert!(tx.forward(signal(SignalKind::SameTabCustomEvent)));
        assert!(tx.forward(signal(SignalKind::Timer)));

        let (first, absorbed) = rx.recv_coalesced().await.expect("signal expected");
        assert_eq!(first.kind, SignalKind::Focus);
        assert_eq!(absorbed, 2);
    }

    #[tokio::test]
    async fn forward_reports_closed_receiver() {
        let (tx, rx) = signal_channel(1);
        drop(rx);
        assert!(!tx.forward(signal(SignalKind::Timer)));
    }
}
