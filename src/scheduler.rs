use crate::arch::{self, Context};
use crate::error::CompleteError;
use crate::future::{Future, WaitCell};
use crate::stack::{DEFAULT_STACK_SIZE, MmapStackAllocator, StackAllocator, StackPointer};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::rc::Rc;
use tracing::{error, trace};

/// A queued unit of work. The only error a task can surface is the
/// completion protocol being violated, which the resolution loop treats as
/// fatal.
type Task = Box<dyn FnOnce() -> Result<(), CompleteError>>;

/// An external event pump whose single-event step can drive a [`Scheduler`].
///
/// Implemented by anything with a "run one pending event" operation, e.g. an
/// I/O reactor or a timer wheel. See
/// [`Scheduler::from_event_source`].
pub trait EventSource {
    /// Runs at most one pending event. May block until one arrives; must not
    /// re-enter the scheduler.
    fn run_one(&mut self);
}

/// The cooperative driver: a task queue, a queue of contexts ready to
/// resume, and a progress step invoked whenever both are empty but somebody
/// is still waiting.
///
/// All suspension happens inside [`Future::wait`]; spawning and completing
/// never block. Everything is single-threaded: the handle is tied to the
/// thread that created it. Clones are cheap and share the same queues, so a
/// task can carry a handle to spawn follow-up work.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<Core>,
}

impl Scheduler {
    /// Creates a scheduler that calls `progress_step` whenever it runs out
    /// of queued work, using mmap'd stacks of [`DEFAULT_STACK_SIZE`] for its
    /// resolution loops.
    ///
    /// The progress step may block for one event-loop tick and is expected
    /// to make forward progress toward fulfilling some pending future; a
    /// step that does nothing keeps the scheduler spinning.
    pub fn new(progress_step: impl FnMut() + 'static) -> Self {
        Self::with_stack_allocator(progress_step, MmapStackAllocator, DEFAULT_STACK_SIZE)
    }

    /// Creates a scheduler with a custom stack provider and per-loop stack
    /// size.
    pub fn with_stack_allocator(
        progress_step: impl FnMut() + 'static,
        allocator: impl StackAllocator + 'static,
        stack_size: usize,
    ) -> Self {
        Scheduler {
            core: Rc::new(Core {
                tasks: RefCell::new(VecDeque::new()),
                ready: RefCell::new(VecDeque::new()),
                progress: RefCell::new(Box::new(progress_step)),
                on_unexpected: RefCell::new(Box::new(default_unexpected_handler)),
                stack_alloc: RefCell::new(Box::new(allocator)),
                stack_size,
            }),
        }
    }

    /// Adapts an event pump into a scheduler: the progress step runs one
    /// pending event per invocation.
    pub fn from_event_source(mut source: impl EventSource + 'static) -> Self {
        Self::new(move || source.run_one())
    }

    /// Replaces the handler invoked when a waiter observes a future that
    /// failed outside its declared error type.
    ///
    /// The handler is not expected to return; if it does, the process is
    /// aborted. The default handler logs and aborts. Tests substitute a
    /// handler that panics with a sentinel instead.
    pub fn set_unexpected_handler(&self, handler: impl FnMut() + 'static) {
        *self.core.on_unexpected.borrow_mut() = Box::new(handler);
    }

    /// Queues `f` for execution and returns the future its return value
    /// will resolve.
    ///
    /// The closure has no declared error type: if it panics, the future
    /// resolves as unexpectedly failed. Tasks run in spawn order, on the
    /// stack of a resolution loop, once some caller blocks on a future of
    /// this scheduler.
    ///
    /// One panic is special: a payload that is a [`CompleteError`] (raised
    /// with [`std::panic::panic_any`]) reports that the task fulfilled some
    /// future a second time. That is a protocol violation, not a task
    /// failure — it propagates to the resolution loop, which aborts the
    /// process.
    pub fn spawn<V: 'static>(&self, f: impl FnOnce() -> V + 'static) -> Future<V> {
        let future = Future::with_core(&self.core);
        let completer = future.clone();
        trace!("spawning task");
        self.core.tasks.borrow_mut().push_back(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => completer.set_result(value),
                Err(payload) => match protocol_violation(payload.as_ref()) {
                    // Never recorded in the future: the violation has to
                    // reach the resolution loop.
                    Some(violation) => Err(violation),
                    None => {
                        trace!(
                            panic = panic_message(payload.as_ref()),
                            "task panicked, resolving its future as unexpected"
                        );
                        completer.set_unexpected()
                    }
                },
            }
        }));
        future
    }

    /// Queues a fallible task: `Ok` resolves the future with the value,
    /// `Err` with the error, and a panic resolves it as unexpectedly
    /// failed.
    ///
    /// An `Err` that is itself a [`CompleteError`] is not a task failure: it
    /// reports a double fulfillment the task propagated through its error
    /// type, and reaches the resolution loop's fatal path instead of the
    /// future. The panic channel described on [`spawn`](Scheduler::spawn)
    /// applies here too.
    pub fn spawn_fallible<V: 'static, E: 'static>(
        &self,
        f: impl FnOnce() -> Result<V, E> + 'static,
    ) -> Future<V, E> {
        let future = Future::with_core(&self.core);
        let completer = future.clone();
        trace!("spawning fallible task");
        self.core.tasks.borrow_mut().push_back(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(value)) => completer.set_result(value),
                Ok(Err(error)) => {
                    if let Some(&violation) = (&error as &dyn Any).downcast_ref::<CompleteError>() {
                        Err(violation)
                    } else {
                        completer.set_error(error)
                    }
                }
                Err(payload) => match protocol_violation(payload.as_ref()) {
                    Some(violation) => Err(violation),
                    None => {
                        trace!(
                            panic = panic_message(payload.as_ref()),
                            "task panicked, resolving its future as unexpected"
                        );
                        completer.set_unexpected()
                    }
                },
            }
        }));
        future
    }

    /// Whether both the task queue and the ready queue are empty.
    pub fn is_idle(&self) -> bool {
        self.core.tasks.borrow().is_empty() && self.core.ready.borrow().is_empty()
    }

    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }
}

pub(crate) struct Core {
    /// Pending task closures, run front to back.
    tasks: RefCell<VecDeque<Task>>,
    /// Contexts eligible to resume, earliest suspended first out.
    ready: RefCell<VecDeque<Context>>,
    /// Invoked when both queues are empty but someone is still waiting.
    progress: RefCell<Box<dyn FnMut()>>,
    /// Invoked when a waiter observes an unexpected failure.
    on_unexpected: RefCell<Box<dyn FnMut()>>,
    stack_alloc: RefCell<Box<dyn StackAllocator>>,
    stack_size: usize,
}

impl Core {
    /// Suspends the calling stack into `save` and runs a resolution loop on
    /// a freshly allocated stack until a ready context resumes the caller.
    /// The loop stack is released here, on the caller's way out.
    pub(crate) fn wait_until_ready(&self, save: &Cell<usize>, preserve_fp: bool) {
        let space = self
            .stack_alloc
            .borrow_mut()
            .allocate(self.stack_size)
            .expect("failed to allocate a resolution-loop stack");
        trace!(
            top = space.top().get(),
            len = space.len(),
            "suspending caller into a resolution loop"
        );

        // Safety: the stack is freshly allocated, and the core outlives the
        // loop because the suspended caller keeps it alive.
        unsafe {
            let context = arch::init_context(space.top(), resolution_loop_entry);
            arch::switch(
                self as *const Core as usize,
                save.as_ptr(),
                context,
                preserve_fp,
            );
        }

        trace!("caller resumed, releasing the loop stack");
        self.stack_alloc.borrow_mut().deallocate(space);
    }

    /// Walks a waiter list head to tail, appending each suspended context to
    /// the ready queue. The cells stay where they are, in their awaiters'
    /// frames.
    pub(crate) fn notify_ready(&self, head: *const WaitCell) {
        let mut ready = self.ready.borrow_mut();
        let mut node = head;
        let mut woken = 0u32;
        while !node.is_null() {
            // Safety: cells are pinned in suspended awaiter frames until the
            // contexts queued here run again.
            let cell = unsafe { &*node };
            let sp = StackPointer::new(cell.ctx.get())
                .expect("waiter context missing its saved stack pointer");
            // Safety: published by the awaiter's suspension switch, resumed
            // at most once by the resolution loop.
            ready.push_back(unsafe { Context::from_sp(sp) });
            node = cell.next.get();
            woken += 1;
        }
        trace!(woken, "queued waiters for resumption");
    }

    /// Diverts into the unexpected-failure handler. Aborts if the handler
    /// returns.
    pub(crate) fn unexpected(&self) -> ! {
        (*self.on_unexpected.borrow_mut())();
        error!("unexpected-failure handler returned, aborting");
        process::abort()
    }

    /// Drains tasks and ticks the progress step until a context is ready,
    /// then hands the CPU to the earliest one.
    fn resolution_loop(&self) -> ! {
        loop {
            while self.ready.borrow().is_empty() {
                let task = self.tasks.borrow_mut().pop_front();
                if let Some(task) = task {
                    trace!("running queued task");
                    if let Err(err) = task() {
                        error!(
                            %err,
                            "a future was fulfilled twice inside the resolution loop; \
                             this is not recoverable"
                        );
                        process::abort();
                    }
                } else {
                    trace!("queues empty, invoking progress step");
                    let step =
                        panic::catch_unwind(AssertUnwindSafe(|| (*self.progress.borrow_mut())()));
                    if step.is_err() {
                        error!(
                            "progress step panicked inside the resolution loop; \
                             this is not recoverable"
                        );
                        process::abort();
                    }
                }
            }

            let context = self
                .ready
                .borrow_mut()
                .pop_front()
                .expect("ready queue drained behind the resolution loop");
            trace!(?context, "resuming earliest ready context");

            // The save slot is write-only scratch: nothing ever resumes this
            // loop context again, and its stack is released by the
            // wait_until_ready frame that allocated it.
            let mut scratch = 0usize;
            // Safety: the context came off the ready queue and is live.
            unsafe {
                arch::switch(0, &mut scratch, context, false);
            }
            unreachable!("resolution loop resumed after handing off its stack");
        }
    }
}

unsafe extern "C" fn resolution_loop_entry(core: usize) -> ! {
    // Safety: wait_until_ready passes its core, which the suspended caller
    // keeps alive for the lifetime of the loop.
    let core = unsafe { &*(core as *const Core) };
    core.resolution_loop()
}

fn default_unexpected_handler() {
    error!("a future completed with a failure outside its declared error type");
}

/// A task reports fulfilling some future a second time by panicking with
/// the violation itself as the payload.
fn protocol_violation(payload: &(dyn Any + Send)) -> Option<CompleteError> {
    payload.downcast_ref::<CompleteError>().copied()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
