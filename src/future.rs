use crate::error::CompleteError;
use crate::scheduler::{Core, Scheduler};
use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::ptr;
use std::rc::{Rc, Weak};
use tracing::trace;

/// One waiting call site: the suspended context of an awaiter, linked into
/// the future's waiter list.
///
/// Cells live in the stack frame of the `wait` call that created them, for
/// exactly as long as that call is suspended. Completion hands the contexts
/// to the scheduler and never touches the cells again.
pub(crate) struct WaitCell {
    /// Saved stack pointer, written during the suspension switch.
    pub(crate) ctx: Cell<usize>,
    /// Next waiter in the list.
    pub(crate) next: Cell<*const WaitCell>,
}

impl WaitCell {
    fn new() -> Self {
        WaitCell {
            ctx: Cell::new(0),
            next: Cell::new(ptr::null()),
        }
    }
}

/// The four states of the one-shot cell. Leaving `Unresolved` happens at
/// most once; the payload lives and dies with its variant.
enum State<V, E> {
    /// Not yet completed; holds the head of the waiter list.
    Unresolved { head: *const WaitCell },
    Success(V),
    Failure(E),
    Unexpected,
}

struct Shared<V, E> {
    scheduler: Weak<Core>,
    state: RefCell<State<V, E>>,
}

impl<V, E> Shared<V, E> {
    fn scheduler(&self) -> Rc<Core> {
        self.scheduler
            .upgrade()
            .expect("scheduler dropped while one of its futures is still in use")
    }

    fn complete(&self, terminal: State<V, E>) -> Result<(), CompleteError> {
        let head = {
            let mut state = self.state.borrow_mut();
            let State::Unresolved { head } = &*state else {
                return Err(CompleteError::AlreadyFulfilled);
            };
            let head = *head;
            // The terminal state must be in place before any waiter can run
            // again: resumed waiters dispatch on it.
            *state = terminal;
            head
        };

        if !head.is_null() {
            self.scheduler().notify_ready(head);
        }
        Ok(())
    }
}

impl<V, E> Drop for Shared<V, E> {
    fn drop(&mut self) {
        if let State::Unresolved { head } = &*self.state.borrow() {
            debug_assert!(
                head.is_null(),
                "future dropped while awaiters are suspended on it"
            );
        }
    }
}

/// A one-shot container for a value of type `V` or an error of type `E`,
/// resolved through a [`Scheduler`].
///
/// A future starts out unresolved and is completed exactly once with
/// [`set_result`](Future::set_result), [`set_error`](Future::set_error) or
/// [`set_unexpected`](Future::set_unexpected); every later completion
/// attempt reports [`CompleteError::AlreadyFulfilled`]. Retrieval through
/// [`wait`](Future::wait) suspends the calling stack until the outcome is
/// in, driving the scheduler's resolution loop in the meantime.
///
/// The handle is cheap to clone; all clones share the same cell. Like
/// everything in this crate it is tied to one thread.
pub struct Future<V, E = Infallible> {
    cell: Rc<Shared<V, E>>,
}

impl<V, E> Clone for Future<V, E> {
    fn clone(&self) -> Self {
        Future {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<V, E> Future<V, E> {
    /// Creates an unresolved future bound to `scheduler`.
    ///
    /// The future holds a non-owning reference: the scheduler must stay
    /// alive for as long as the future is used.
    pub fn new(scheduler: &Scheduler) -> Self {
        Future {
            cell: Rc::new(Shared {
                scheduler: Rc::downgrade(scheduler.core()),
                state: RefCell::new(State::Unresolved { head: ptr::null() }),
            }),
        }
    }

    pub(crate) fn with_core(core: &Rc<Core>) -> Self {
        Future {
            cell: Rc::new(Shared {
                scheduler: Rc::downgrade(core),
                state: RefCell::new(State::Unresolved { head: ptr::null() }),
            }),
        }
    }

    /// Whether the future has left its unresolved state.
    pub fn is_resolved(&self) -> bool {
        !matches!(&*self.cell.state.borrow(), State::Unresolved { .. })
    }

    /// Fulfills the future with a value and wakes every waiter.
    ///
    /// # Errors
    ///
    /// [`CompleteError::AlreadyFulfilled`] if the future was completed
    /// before; the stored outcome is left untouched.
    pub fn set_result(&self, value: V) -> Result<(), CompleteError> {
        trace!("resolving future");
        self.cell.complete(State::Success(value))
    }

    /// Fulfills the future with the error to hand to waiting code.
    ///
    /// # Errors
    ///
    /// [`CompleteError::AlreadyFulfilled`] if the future was completed
    /// before.
    pub fn set_error(&self, error: E) -> Result<(), CompleteError> {
        trace!("failing future");
        self.cell.complete(State::Failure(error))
    }

    /// Records that the producing task failed outside its declared error
    /// type. Waiters observe this through the scheduler's unexpected
    /// handler.
    ///
    /// # Errors
    ///
    /// [`CompleteError::AlreadyFulfilled`] if the future was completed
    /// before.
    pub fn set_unexpected(&self) -> Result<(), CompleteError> {
        trace!("marking future unexpectedly failed");
        self.cell.complete(State::Unexpected)
    }

    /// Returns the outcome, suspending the calling stack until the future
    /// resolves.
    ///
    /// While suspended, the scheduler drains queued tasks and invokes its
    /// progress step; any of those may complete this future. Every waiter
    /// receives its own copy of the outcome. An unexpectedly failed future
    /// diverts into the scheduler's unexpected handler and does not return.
    pub fn wait(&self) -> Result<V, E>
    where
        V: Clone,
        E: Clone,
    {
        self.wait_inner(false)
    }

    /// Like [`wait`](Future::wait), but carries the floating-point control
    /// state across the suspension. Only needed by callers that tuned
    /// rounding or exception flags and expect them intact on resumption.
    pub fn wait_preserving_fp(&self) -> Result<V, E>
    where
        V: Clone,
        E: Clone,
    {
        self.wait_inner(true)
    }

    fn wait_inner(&self, preserve_fp: bool) -> Result<V, E>
    where
        V: Clone,
        E: Clone,
    {
        loop {
            {
                let state = self.cell.state.borrow();
                match &*state {
                    State::Success(value) => return Ok(value.clone()),
                    State::Failure(error) => return Err(error.clone()),
                    _ => {}
                }
            }

            let scheduler = self.cell.scheduler();
            let waiter = WaitCell::new();
            let mut unexpected = false;
            {
                let mut state = self.cell.state.borrow_mut();
                match &mut *state {
                    State::Unexpected => unexpected = true,
                    State::Unresolved { head } => {
                        // Newest waiter goes to the front; completion walks
                        // head to tail, so resumption is in reverse-suspend
                        // order.
                        waiter.next.set(*head);
                        *head = &waiter as *const WaitCell;
                    }
                    // Completed since the check above: dispatch again.
                    _ => continue,
                }
            }

            if unexpected {
                scheduler.unexpected();
            }

            // A single completion wakes all waiters, so the state has to be
            // inspected afresh once we are back.
            scheduler.wait_until_ready(&waiter.ctx, preserve_fp);
        }
    }
}
