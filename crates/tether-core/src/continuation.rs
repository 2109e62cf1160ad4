//! Single-shot continuations for sequencing asynchronous round trips.
//!
//! A [`Continuation`] owns one suspended computation (any `Future`) and
//! moves through `Created → Suspended → Completed → Consumed`, or ends
//! `Abandoned` if it is given up before completing. Nothing resumes it
//! implicitly: the owner calls [`Continuation::start`] and
//! [`Continuation::resume`], or awaits it from a parent computation.
//!
//! A panic inside the computation is caught and stored in place of the
//! result. [`Continuation::extract_result`] re-raises it, so the failure
//! lands on whoever consumes the result.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};

use tracing::debug;

use crate::error::{Error, Result};

/// Observable lifecycle of a [`Continuation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not started yet.
    Created,
    /// Waiting at a suspension point.
    Suspended,
    /// Result (or captured panic) available.
    Completed,
    /// Result taken.
    Consumed,
    /// Given up before completion.
    Abandoned,
}

type Computation<T> = Pin<Box<dyn Future<Output = T>>>;
type Outcome<T> = std::result::Result<T, Box<dyn Any + Send>>;

enum Stage<T> {
    Created(Computation<T>),
    Suspended(Computation<T>),
    Completed(Outcome<T>),
    Consumed,
    Abandoned,
}

impl<T> Stage<T> {
    fn state(&self) -> State {
        match self {
            Stage::Created(_) => State::Created,
            Stage::Suspended(_) => State::Suspended,
            Stage::Completed(_) => State::Completed,
            Stage::Consumed => State::Consumed,
            Stage::Abandoned => State::Abandoned,
        }
    }
}

/// Wake flag of a continuation driven by hand.
#[derive(Default)]
struct Signal {
    woken: AtomicBool,
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
    }
}

/// One in-flight asynchronous computation producing a `T`.
pub struct Continuation<T> {
    stage: Stage<T>,
    parent: Option<Waker>,
    signal: Arc<Signal>,
}

impl<T: 'static> Continuation<T> {
    /// Wraps `computation` without running any of it.
    pub fn new(computation: impl Future<Output = T> + 'static) -> Self {
        Self {
            stage: Stage::Created(Box::pin(computation)),
            parent: None,
            signal: Arc::default(),
        }
    }
}

impl<T> Continuation<T> {
    pub fn state(&self) -> State {
        self.stage.state()
    }

    /// True once something the computation waits on has signalled
    /// progress since it last ran.
    pub fn is_woken(&self) -> bool {
        self.signal.woken.load(Ordering::Acquire)
    }

    /// Runs the computation up to its first suspension point.
    ///
    /// Valid only in `Created`. Returns the state reached: `Suspended`, or
    /// `Completed` if it never had to wait.
    pub fn start(&mut self) -> Result<State> {
        match self.stage {
            Stage::Created(_) => {
                let waker = Waker::from(self.signal.clone());
                Ok(self.run(&waker))
            }
            _ => Err(self.misuse("start")),
        }
    }

    /// Runs the computation from its current suspension point.
    ///
    /// Valid only in `Suspended`; resuming a finished continuation is an
    /// error.
    pub fn resume(&mut self) -> Result<State> {
        match self.stage {
            Stage::Suspended(_) => {
                let waker = Waker::from(self.signal.clone());
                Ok(self.run(&waker))
            }
            _ => Err(self.misuse("resume")),
        }
    }

    /// Sets the parent to wake when this continuation completes, replacing
    /// any earlier one. Valid only while `Suspended`.
    pub fn set_parent(&mut self, parent: Waker) -> Result<()> {
        match self.stage {
            Stage::Suspended(_) => {
                self.parent = Some(parent);
                Ok(())
            }
            _ => Err(self.misuse("set the parent of")),
        }
    }

    /// Takes the result. Valid exactly once, from `Completed`.
    ///
    /// If the computation panicked, the panic resumes here.
    pub fn extract_result(&mut self) -> Result<T> {
        match mem::replace(&mut self.stage, Stage::Consumed) {
            Stage::Completed(Ok(value)) => Ok(value),
            Stage::Completed(Err(payload)) => panic::resume_unwind(payload),
            other => {
                self.stage = other;
                Err(self.misuse("extract the result of"))
            }
        }
    }

    /// Drops the computation without running the rest of it.
    ///
    /// Whatever it was waiting on is not told. A no-op once completed.
    pub fn abandon(&mut self) {
        if matches!(self.stage, Stage::Created(_) | Stage::Suspended(_)) {
            debug!(state = ?self.state(), "continuation abandoned");
            self.stage = Stage::Abandoned;
            self.parent = None;
        }
    }

    fn misuse(&self, operation: &'static str) -> Error {
        Error::InvalidContinuationState {
            operation,
            state: self.state(),
        }
    }

    fn run(&mut self, waker: &Waker) -> State {
        let mut computation = match mem::replace(&mut self.stage, Stage::Consumed) {
            Stage::Created(c) | Stage::Suspended(c) => c,
            other => {
                self.stage = other;
                return self.state();
            }
        };

        self.signal.woken.store(false, Ordering::Release);
        let mut cx = Context::from_waker(waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| computation.as_mut().poll(&mut cx)));

        match polled {
            Ok(Poll::Pending) => self.stage = Stage::Suspended(computation),
            Ok(Poll::Ready(value)) => self.complete(Ok(value)),
            Err(payload) => self.complete(Err(payload)),
        }
        self.state()
    }

    fn complete(&mut self, outcome: Outcome<T>) {
        self.stage = Stage::Completed(outcome);
        if let Some(parent) = self.parent.take() {
            parent.wake();
        }
    }
}

/// Awaiting a continuation runs it with the awaiting task's waker, makes
/// that task its parent, and yields the extracted result.
impl<T> Future for Continuation<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if matches!(this.stage, Stage::Created(_) | Stage::Suspended(_)) {
            this.run(cx.waker());
        }
        match this.stage {
            Stage::Suspended(_) => {
                this.parent = Some(cx.waker().clone());
                Poll::Pending
            }
            Stage::Completed(_) => match this.extract_result() {
                Ok(value) => Poll::Ready(value),
                Err(err) => unreachable!("{err}"),
            },
            _ => panic!("continuation polled after its result was taken"),
        }
    }
}

// The computation is boxed and pinned on its own; the wrapper may move.
impl<T> Unpin for Continuation<T> {}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("state", &self.state())
            .field("woken", &self.is_woken())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use super::*;

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl CountingWaker {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_parent_observes_the_result_exactly_once() {
        let (tx, rx) = oneshot::channel::<u32>();
        let mut cont = Continuation::new(async move { rx.await.unwrap() });

        assert_eq!(cont.start().unwrap(), State::Suspended);
        let parent = Arc::new(CountingWaker::default());
        cont.set_parent(Waker::from(parent.clone())).unwrap();
        assert!(!cont.is_woken());

        tx.send(99).unwrap();
        assert!(cont.is_woken());
        assert_eq!(cont.resume().unwrap(), State::Completed);
        assert_eq!(parent.count(), 1);

        assert_eq!(cont.extract_result().unwrap(), 99);
        assert_eq!(cont.state(), State::Consumed);
        let err = cont.extract_result().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidContinuationState {
                state: State::Consumed,
                ..
            }
        ));
        assert_eq!(parent.count(), 1);
    }

    #[test]
    fn test_extracting_before_completion_is_rejected() {
        let (_tx, rx) = oneshot::channel::<u32>();
        let mut cont = Continuation::new(rx);

        let err = cont.extract_result().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidContinuationState {
                state: State::Created,
                ..
            }
        ));

        cont.start().unwrap();
        let err = cont.extract_result().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidContinuationState {
                state: State::Suspended,
                ..
            }
        ));
        assert_eq!(cont.state(), State::Suspended);
    }

    #[test]
    fn test_out_of_order_operations_are_rejected() {
        let mut cont = Continuation::new(async { 1 });
        assert!(cont.resume().is_err());
        assert!(cont.set_parent(Waker::noop().clone()).is_err());

        assert_eq!(cont.start().unwrap(), State::Completed);
        assert!(cont.start().is_err());
        let err = cont.resume().unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot resume a continuation in state Completed"
        );
        assert_eq!(cont.extract_result().unwrap(), 1);
    }

    #[test]
    fn test_dropping_a_suspended_continuation_skips_the_rest() {
        let (tx, rx) = oneshot::channel::<()>();
        let finished = Rc::new(Cell::new(false));
        let flag = finished.clone();
        let mut cont = Continuation::new(async move {
            let _ = rx.await;
            flag.set(true);
        });
        cont.start().unwrap();

        drop(cont);
        assert!(!finished.get());
        // The abandoned computation no longer listens.
        assert!(tx.send(()).is_err());
    }

    #[test]
    fn test_abandon_is_observable_and_final() {
        let (_tx, rx) = oneshot::channel::<()>();
        let mut cont = Continuation::new(rx);
        cont.start().unwrap();
        cont.abandon();

        assert_eq!(cont.state(), State::Abandoned);
        assert!(cont.resume().is_err());
        assert!(cont.extract_result().is_err());
    }

    #[test]
    fn test_captured_panic_resurfaces_on_extraction() {
        let mut cont = Continuation::new(async {
            if true {
                panic!("round trip failed");
            }
            0u8
        });
        assert_eq!(cont.start().unwrap(), State::Completed);

        let payload = panic::catch_unwind(AssertUnwindSafe(|| cont.extract_result())).unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"round trip failed"));
    }

    #[test]
    fn test_awaiting_a_child_chains_results() {
        let (tx, rx) = oneshot::channel::<u32>();
        let child = Continuation::new(async move { rx.await.unwrap() + 1 });
        let mut parent = Continuation::new(async move { child.await * 2 });

        assert_eq!(parent.start().unwrap(), State::Suspended);
        tx.send(20).unwrap();
        assert!(parent.is_woken());
        assert_eq!(parent.resume().unwrap(), State::Completed);
        assert_eq!(parent.extract_result().unwrap(), 42);
    }

    #[test]
    fn test_dropped_sender_is_a_canceled_result() {
        let (tx, rx) = oneshot::channel::<u32>();
        let mut cont = Continuation::new(async move { rx.await.ok() });
        cont.start().unwrap();

        drop(tx);
        assert!(cont.is_woken());
        cont.resume().unwrap();
        assert_eq!(cont.extract_result().unwrap(), None);
    }
}
