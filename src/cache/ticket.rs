//! Ticket Module
//!
//! Completion handle returned by cache operations. A ticket is either already
//! resolved (memory store, invalid durable store) or waits on the answer of a
//! store's worker.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::{CacheError, Result};

/// Sending half handed to whoever will resolve a pending ticket.
pub(crate) type Resolver<T> = oneshot::Sender<Result<T>>;

// == Ticket ==
/// The eventual outcome of a cache operation.
///
/// Await it from async code, call [`Ticket::wait`] from synchronous code, or
/// hand it a callback and a runtime with [`Ticket::deliver_on`]. Dropping a
/// ticket does not cancel the operation.
#[must_use = "dropping a ticket discards the result, the operation still runs"]
#[derive(Debug)]
pub struct Ticket<T> {
    state: State<T>,
}

#[derive(Debug)]
enum State<T> {
    Ready(Option<Result<T>>),
    Pending(oneshot::Receiver<Result<T>>),
}

impl<T> Ticket<T> {
    /// A ticket that already holds its result.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }

    /// A pending ticket plus the resolver that completes it.
    pub(crate) fn pending() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: State::Pending(rx),
            },
        )
    }

    /// Whether the result is available without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    // == Wait ==
    /// Blocks the current thread until the result is available.
    ///
    /// Must not be called on an async runtime thread for a pending ticket;
    /// await the ticket there instead.
    pub fn wait(self) -> Result<T> {
        match self.state {
            State::Ready(result) => result.unwrap_or(Err(CacheError::WorkerStopped)),
            State::Pending(rx) => rx.blocking_recv().unwrap_or(Err(CacheError::WorkerStopped)),
        }
    }
}

impl<T: Send + 'static> Ticket<T> {
    // == Deliver On ==
    /// Runs `callback` on `handle`'s runtime once the result is known.
    ///
    /// The callback is always invoked, with an error if the store's worker
    /// went away.
    pub fn deliver_on<F>(self, handle: &Handle, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        handle.spawn(async move {
            callback(self.await);
        });
    }
}

// The result is only ever moved out, never pinned in place.
impl<T> Unpin for Ticket<T> {}

impl<T> Future for Ticket<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(CacheError::WorkerStopped)))
            }
            State::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CacheError::WorkerStopped))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_ready_ticket_wait() {
        let ticket = Ticket::ready(Ok(5u32));
        assert!(ticket.is_ready());
        assert_eq!(ticket.wait().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_ready_ticket_await() {
        let ticket = Ticket::ready(Ok("done"));
        assert_eq!(ticket.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_pending_ticket_resolves() {
        let (resolver, ticket) = Ticket::pending();
        assert!(!ticket.is_ready());
        resolver.send(Ok(vec![1u8, 2, 3])).unwrap();
        assert_eq!(ticket.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dropped_resolver_reports_worker_stopped() {
        let (resolver, ticket) = Ticket::<()>::pending();
        drop(resolver);
        assert!(matches!(ticket.await, Err(CacheError::WorkerStopped)));
    }

    #[test]
    fn test_pending_ticket_wait_from_thread() {
        let (resolver, ticket) = Ticket::pending();
        let worker = std::thread::spawn(move || {
            resolver.send(Ok(9u8)).unwrap();
        });
        assert_eq!(ticket.wait().unwrap(), 9);
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn test_deliver_on_runs_callback() {
        let (tx, rx) = mpsc::channel();
        let (resolver, ticket) = Ticket::pending();

        ticket.deliver_on(&Handle::current(), move |result: Result<u32>| {
            tx.send(result.unwrap()).unwrap();
        });
        resolver.send(Ok(11)).unwrap();

        let delivered = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(delivered, 11);
    }
}
