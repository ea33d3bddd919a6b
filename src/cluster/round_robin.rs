//! Round-robin worker selection.

use std::sync::atomic::{AtomicUsize, Ordering};

/// No worker to dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("No workers available")]
    NoWorkersAvailable,
}

/// Rotates through workers in registration order.
///
/// The cursor always points at the next worker to pick. It is reduced modulo
/// the current worker count on every call, so the set may grow or shrink
/// between calls.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the worker under the cursor and advance it.
    pub fn next<T: Clone>(&self, workers: &[T]) -> Result<T, DispatchError> {
        let len = workers.len();
        if len == 0 {
            return Err(DispatchError::NoWorkersAvailable);
        }

        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                Some((cursor % len + 1) % len)
            })
            .unwrap_or_else(|cursor| cursor);

        Ok(workers[previous % len].clone())
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seven_dispatches_over_three_workers() {
        let dispatcher = RoundRobin::new();
        let workers = ["W1", "W2", "W3"];

        let picked: Vec<_> = (0..7).map(|_| dispatcher.next(&workers).unwrap()).collect();

        assert_eq!(picked, ["W1", "W2", "W3", "W1", "W2", "W3", "W1"]);
        assert_eq!(dispatcher.cursor(), 1);
    }

    #[test]
    fn empty_set_is_an_error() {
        let dispatcher = RoundRobin::new();
        let workers: [u8; 0] = [];
        assert_eq!(
            dispatcher.next(&workers),
            Err(DispatchError::NoWorkersAvailable)
        );
        assert_eq!(dispatcher.cursor(), 0);
    }

    #[test]
    fn fair_over_full_rotations() {
        let dispatcher = RoundRobin::new();
        let workers = [0usize, 1, 2, 3];
        let mut counts = [0u32; 4];
        for _ in 0..400 {
            counts[dispatcher.next(&workers).unwrap()] += 1;
        }
        assert_eq!(counts, [100; 4]);
    }

    #[test]
    fn cursor_renormalizes_when_set_shrinks() {
        let dispatcher = RoundRobin::new();
        let workers = ["a", "b", "c", "d"];
        for _ in 0..3 {
            dispatcher.next(&workers).unwrap();
        }
        assert_eq!(dispatcher.cursor(), 3);

        let fewer = ["a", "b"];
        assert_eq!(dispatcher.next(&fewer).unwrap(), "b");
        assert_eq!(dispatcher.next(&fewer).unwrap(), "a");
        assert!(dispatcher.cursor() < fewer.len());
    }
}
