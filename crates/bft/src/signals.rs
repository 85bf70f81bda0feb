//! Single-shot coordination signals for the pacemaker.
//!
//! A [`Signal`] is a rendezvous slot: the core resolves it when a state
//! transition happens, and resolving installs a fresh slot by advancing the
//! sequence number. A [`Ticket`] taken before a resolution observes exactly
//! that resolution; a ticket taken after it waits for the next one.
//!
//! Signals are polled, not woken. The core is single-threaded and the host
//! drives it in event-loop turns, so the host polls its tickets after each
//! turn instead of parking a task.

/// A resolve-then-replace rendezvous slot.
#[derive(Debug, Clone)]
pub struct Signal<T> {
    seq: u64,
    value: Option<T>,
}

/// A waiter's handle on a [`Signal`], bound to the resolution sequence at
/// the time it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    seq: u64,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            seq: 0,
            value: None,
        }
    }
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a ticket for the next resolution.
    pub fn watch(&self) -> Ticket {
        Ticket { seq: self.seq }
    }

    /// Take a ticket that is already satisfied by the latest resolution.
    ///
    /// Only meaningful on a resolved signal; on a fresh one it behaves like
    /// [`Signal::watch`].
    pub fn watch_ready(&self) -> Ticket {
        Ticket {
            seq: self.seq.saturating_sub(1),
        }
    }

    /// Whether the signal has ever resolved.
    pub fn is_resolved(&self) -> bool {
        self.seq > 0
    }

    /// Publish a value to every outstanding ticket and re-arm the slot.
    pub fn resolve(&mut self, value: T) {
        self.seq += 1;
        self.value = Some(value);
    }

    /// The value resolved after `ticket` was taken, if any.
    pub fn poll(&self, ticket: Ticket) -> Option<T> {
        if self.seq > ticket.seq {
            self.value.clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_sees_only_later_resolutions() {
        let mut signal = Signal::new();
        let early = signal.watch();
        assert_eq!(signal.poll(early), None);

        signal.resolve(7u32);
        assert_eq!(signal.poll(early), Some(7));

        // A ticket taken after the resolution waits for the next one.
        let late = signal.watch();
        assert_eq!(signal.poll(late), None);
        signal.resolve(8);
        assert_eq!(signal.poll(late), Some(8));
    }

    #[test]
    fn watch_ready_is_satisfied_by_latest() {
        let mut signal = Signal::new();
        signal.resolve(());
        assert_eq!(signal.poll(signal.watch_ready()), Some(()));
        assert_eq!(signal.poll(signal.watch()), None);
    }
}
