// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Single-Settlement Completion
//!
//! Connections, channels and consumers each own one [`Lifecycle`]: a "dying" flag plus
//! a [`Completion`] cell that is settled exactly once. Every later settlement attempt is
//! a no-op, which is what lets a deadline timer and the real shutdown work race to
//! settle the same outcome.

use crate::errors::AmqpError;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::warn;

pub(crate) type Outcome = Result<(), AmqpError>;

/// A result cell that can be set exactly once and awaited by any number of callers.
#[derive(Clone)]
pub(crate) struct Completion {
    slot: Arc<watch::Sender<Option<Outcome>>>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Completion {
            slot: Arc::new(slot),
        }
    }

    /// Stores `outcome` unless one is already stored. Returns whether this call won.
    pub(crate) fn settle(&self, outcome: Outcome) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Waits for the settled outcome.
    pub(crate) async fn wait(&self) -> Outcome {
        let mut rx = self.slot.subscribe();
        let settled = rx.wait_for(Option::is_some).await.map(|slot| (*slot).clone());
        match settled {
            Ok(Some(outcome)) => outcome,
            // the sender lives in `self`, so the channel cannot close while waiting
            _ => Ok(()),
        }
    }
}

/// The open/dying/completed state shared by every level of the hierarchy.
///
/// `open` holds exactly while the completion is unsettled and the entity is not dying.
pub(crate) struct Lifecycle {
    dying: AtomicBool,
    completion: Completion,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Lifecycle {
            dying: AtomicBool::new(false),
            completion: Completion::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.dying.load(Ordering::SeqCst) && !self.completion.is_settled()
    }

    /// Marks the entity as dying. Only the first caller on an open entity gets `true`
    /// and must perform the shutdown; everyone else just awaits the outcome.
    pub(crate) fn begin_shutdown(&self) -> bool {
        if self.completion.is_settled() {
            return false;
        }
        !self.dying.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_dying(&self) {
        self.dying.store(true, Ordering::SeqCst);
    }

    pub(crate) fn settle(&self, outcome: Outcome) -> bool {
        self.completion.settle(outcome)
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub(crate) async fn wait(&self) -> Outcome {
        self.completion.wait().await
    }

    /// Spawns a timer that settles the completion with `error` unless something else
    /// settles it first. The timer never touches the work it bounds.
    pub(crate) fn arm_deadline(&self, after: Duration, error: AmqpError) {
        let completion = self.completion.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    let description = error.to_string();
                    if completion.settle(Err(error)) {
                        warn!(error = description, "deadline forced completion");
                    }
                }
                _ = completion.wait() => {}
            }
        });
    }
}

/// Settles `outcome` from `reason`: success when no reason was supplied.
pub(crate) fn outcome_from(reason: Option<AmqpError>) -> Outcome {
    match reason {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_the_first_settlement_wins() {
        let completion = Completion::new();

        assert!(completion.settle(Err(AmqpError::ConnectionClosed)));
        assert!(!completion.settle(Ok(())));

        assert!(matches!(
            completion.wait().await,
            Err(AmqpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn waiters_registered_before_settlement_see_it() {
        let completion = Completion::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let c = completion.clone();
                tokio::spawn(async move { c.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        completion.settle(Ok(()));

        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
    }

    #[test]
    fn shutdown_begins_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_open());
        assert!(lifecycle.begin_shutdown());
        assert!(!lifecycle.begin_shutdown());
        assert!(!lifecycle.is_open());
    }

    #[test]
    fn settled_lifecycles_cannot_begin_shutdown() {
        let lifecycle = Lifecycle::new();
        lifecycle.settle(Err(AmqpError::ConnectionClosed));
        assert!(!lifecycle.is_open());
        assert!(!lifecycle.begin_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_settles_when_nothing_else_does() {
        let lifecycle = Lifecycle::new();
        lifecycle.arm_deadline(
            Duration::from_secs(5),
            AmqpError::ChannelCloseTimeout(Duration::from_secs(5)),
        );

        let started = tokio::time::Instant::now();
        let outcome = lifecycle.wait().await;

        assert!(matches!(outcome, Err(AmqpError::ChannelCloseTimeout(_))));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_loses_to_an_earlier_settlement() {
        let lifecycle = Lifecycle::new();
        lifecycle.arm_deadline(
            Duration::from_secs(5),
            AmqpError::ChannelCloseTimeout(Duration::from_secs(5)),
        );
        lifecycle.settle(Ok(()));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(lifecycle.wait().await.is_ok());
    }
}
