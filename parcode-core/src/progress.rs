use std::sync::{Mutex, PoisonError};

use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

const PROGRESS_TEMPLATE: &str =
    "[{elapsed_precise}] [{wide_bar}] {percent:>3}% {pos}/{len} ({per_sec}, eta {eta})";

/// Message a worker sends to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Frames newly encoded.
    Advance(usize),
    /// Frames previously reported by an attempt that did not make it.
    Retract(usize),
}

/// Frame counter of a whole run. Starts at the frames already committed by a
/// previous session and is never persisted.
#[derive(Debug)]
pub struct ProgressCounter {
    total:    usize,
    position: Mutex<usize>,
    bar:      Option<ProgressBar>,
}

impl ProgressCounter {
    #[inline]
    pub fn new(total: usize, initial: usize) -> Self {
        Self {
            total,
            position: Mutex::new(initial),
            bar: None,
        }
    }

    /// Renders the counter as a progress bar on stderr.
    #[inline]
    #[must_use]
    pub fn with_bar(mut self) -> Self {
        let bar = ProgressBar::new(self.total as u64);
        match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => warn!("invalid progress bar template: {e}"),
        }
        bar.set_position(self.position() as u64);
        bar.reset_eta();
        self.bar = Some(bar);
        self
    }

    #[inline]
    pub fn advance(&self, delta: usize) {
        let mut position = self.position.lock().unwrap_or_else(PoisonError::into_inner);
        *position += delta;
        if let Some(bar) = &self.bar {
            bar.set_position(*position as u64);
        }
    }

    #[inline]
    pub fn retract(&self, delta: usize) {
        let mut position = self.position.lock().unwrap_or_else(PoisonError::into_inner);
        *position = position.saturating_sub(delta);
        if let Some(bar) = &self.bar {
            bar.set_position(*position as u64);
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies events until every sender is dropped.
    #[inline]
    pub fn aggregate(&self, events: &Receiver<ProgressEvent>) {
        for event in events {
            match event {
                ProgressEvent::Advance(delta) => self.advance(delta),
                ProgressEvent::Retract(delta) => self.retract(delta),
            }
        }
    }

    #[inline]
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn concurrent_advances_are_exact() {
        let counter = ProgressCounter::new(1_000_000, 17);
        thread::scope(|s| {
            for worker in 0..8 {
                let counter = &counter;
                s.spawn(move || {
                    for i in 0..1000 {
                        counter.advance((worker + i) % 5);
                    }
                });
            }
        });

        let expected: usize = (0..8).flat_map(|w| (0..1000).map(move |i| (w + i) % 5)).sum();
        assert_eq!(counter.position(), 17 + expected);
    }

    #[test]
    fn channel_deltas_sum_to_total() {
        let counter = ProgressCounter::new(100_000, 0);
        let (tx, rx) = crossbeam_channel::unbounded();

        thread::scope(|s| {
            let aggregator = s.spawn(|| counter.aggregate(&rx));
            for worker in 0..6_usize {
                let tx = tx.clone();
                s.spawn(move || {
                    for i in 0..500 {
                        tx.send(ProgressEvent::Advance(worker + i % 3)).unwrap();
                    }
                    tx.send(ProgressEvent::Retract(worker)).unwrap();
                });
            }
            drop(tx);
            aggregator.join().unwrap();
        });

        let expected: usize =
            (0..6).map(|w| (0..500).map(|i| w + i % 3).sum::<usize>() - w).sum();
        assert_eq!(counter.position(), expected);
    }

    #[test]
    fn retract_saturates() {
        let counter = ProgressCounter::new(10, 3);
        counter.retract(5);
        assert_eq!(counter.position(), 0);
    }
}
