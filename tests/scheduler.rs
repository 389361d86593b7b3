use coopfut::stack::{MmapStackAllocator, StackAllocator, StackSpace};
use coopfut::{EventSource, Future, Scheduler};
use std::cell::{Cell, RefCell};
use std::env;
use std::panic::{self, AssertUnwindSafe};
use std::process::{self, Command, Stdio};
use std::rc::Rc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn immediate_spawn_and_wait() {
    init_tracing();

    let sched = Scheduler::new(|| {});
    let fut = sched.spawn(|| 42);

    assert_eq!(fut.wait(), Ok(42));
    assert!(sched.is_idle());
}

#[derive(Debug, Clone, PartialEq)]
struct TaskError(&'static str);

#[test]
fn typed_error_propagates_to_the_waiter() {
    let sched = Scheduler::new(|| {});
    let fut = sched.spawn_fallible(|| Err::<i32, _>(TaskError("x")));

    assert_eq!(fut.wait(), Err(TaskError("x")));

    // The scheduler stays usable after a task failure.
    let again = sched.spawn(|| 7);
    assert_eq!(again.wait(), Ok(7));
    assert!(sched.is_idle());
}

#[test]
fn panicking_task_diverts_into_the_unexpected_handler() {
    let sched = Scheduler::new(|| {});
    sched.set_unexpected_handler(|| panic!("unexpected-failure sentinel"));

    let fut = sched.spawn(|| -> i32 { panic!("boom") });

    let payload = panic::catch_unwind(AssertUnwindSafe(|| fut.wait())).unwrap_err();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .unwrap_or("<non-string payload>");
    assert!(message.contains("unexpected-failure sentinel"));
}

#[test]
fn cross_future_wait() {
    init_tracing();

    let sched = Scheduler::new(|| {});
    let first_runs = Rc::new(Cell::new(0));
    let second_runs = Rc::new(Cell::new(0));

    let f1 = {
        let runs = Rc::clone(&first_runs);
        sched.spawn(move || {
            runs.set(runs.get() + 1);
            1
        })
    };
    let f2 = {
        let runs = Rc::clone(&second_runs);
        let f1 = f1.clone();
        sched.spawn(move || {
            runs.set(runs.get() + 1);
            f1.wait().unwrap() + 1
        })
    };

    assert_eq!(f2.wait(), Ok(2));
    assert_eq!(first_runs.get(), 1);
    assert_eq!(second_runs.get(), 1);
    assert!(sched.is_idle());
}

#[test]
fn task_suspends_until_another_task_completes_the_gate() {
    let sched = Scheduler::new(|| {});
    let gate = Future::<i32>::new(&sched);

    let doubled = {
        let gate = gate.clone();
        sched.spawn(move || gate.wait().unwrap() * 2)
    };
    {
        let gate = gate.clone();
        sched.spawn(move || gate.set_result(21).unwrap());
    }

    assert_eq!(doubled.wait(), Ok(42));
    assert!(sched.is_idle());
}

#[test]
fn progress_step_drives_an_external_future() {
    init_tracing();

    let ticks = Rc::new(Cell::new(0u32));
    let slot: Rc<RefCell<Option<Future<i32>>>> = Rc::new(RefCell::new(None));

    let sched = {
        let ticks = Rc::clone(&ticks);
        let slot = Rc::clone(&slot);
        Scheduler::new(move || {
            ticks.set(ticks.get() + 1);
            if ticks.get() == 3 {
                slot.borrow().as_ref().unwrap().set_result(5).unwrap();
            }
        })
    };

    let fut = Future::<i32>::new(&sched);
    *slot.borrow_mut() = Some(fut.clone());

    assert_eq!(fut.wait(), Ok(5));
    assert!(ticks.get() >= 3);
}

#[test]
fn tasks_run_in_spawn_order() {
    let sched = Scheduler::new(|| {});
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 1..=3 {
        let order = Rc::clone(&order);
        sched.spawn(move || order.borrow_mut().push(i));
    }
    let last = {
        let order = Rc::clone(&order);
        sched.spawn(move || order.borrow_mut().push(4))
    };

    last.wait().unwrap();
    assert_eq!(*order.borrow(), vec![1, 2, 3, 4]);
}

#[test]
fn wake_all_resumes_in_reverse_suspend_order() {
    let sched = Scheduler::new(|| {});
    let gate = Future::<()>::new(&sched);
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut waiters = Vec::new();
    for i in 1..=3 {
        let gate = gate.clone();
        let order = Rc::clone(&order);
        waiters.push(sched.spawn(move || {
            gate.wait().unwrap();
            order.borrow_mut().push(i);
        }));
    }
    {
        let gate = gate.clone();
        sched.spawn(move || gate.set_result(()).unwrap());
    }

    // The first spawned waiter is the last to resume, so waiting on it
    // drains everything.
    waiters[0].wait().unwrap();

    assert_eq!(*order.borrow(), vec![3, 2, 1]);
    for waiter in &waiters {
        assert!(waiter.is_resolved());
    }
    assert!(sched.is_idle());
}

#[test]
fn task_can_spawn_more_work() {
    let sched = Scheduler::new(|| {});
    let inner_ran = Rc::new(Cell::new(false));

    let outer = {
        let sched = sched.clone();
        let inner_ran = Rc::clone(&inner_ran);
        sched.clone().spawn(move || {
            let inner = sched.spawn(move || inner_ran.set(true));
            inner.wait().unwrap();
        })
    };

    outer.wait().unwrap();
    assert!(inner_ran.get());
    assert!(sched.is_idle());
}

struct CountingSource {
    ticks: Rc<Cell<u32>>,
    slot: Rc<RefCell<Option<Future<u8>>>>,
}

impl EventSource for CountingSource {
    fn run_one(&mut self) {
        self.ticks.set(self.ticks.get() + 1);
        if let Some(fut) = self.slot.borrow().as_ref() {
            fut.set_result(9).ok();
        }
    }
}

#[test]
fn event_source_adapter_pumps_one_event_per_tick() {
    let ticks = Rc::new(Cell::new(0));
    let slot = Rc::new(RefCell::new(None));

    let sched = Scheduler::from_event_source(CountingSource {
        ticks: Rc::clone(&ticks),
        slot: Rc::clone(&slot),
    });

    let fut = Future::<u8>::new(&sched);
    *slot.borrow_mut() = Some(fut.clone());

    assert_eq!(fut.wait(), Ok(9));
    assert!(ticks.get() >= 1);
}

#[test]
fn unit_future_works_as_a_barrier() {
    let sched = Scheduler::new(|| {});
    let done = sched.spawn(|| ());
    assert_eq!(done.wait(), Ok(()));
}

/// Runs this test binary again with only `test_name` selected and `env_flag`
/// set, and asserts the child died instead of exiting cleanly. Used for the
/// paths that end in `process::abort`.
fn assert_child_aborts(test_name: &str, env_flag: &str) {
    let status = Command::new(env::current_exe().unwrap())
        .arg(test_name)
        .arg("--exact")
        .env(env_flag, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success(), "double fulfillment was not fatal");
}

#[test]
fn double_fulfill_escaping_a_task_is_fatal() {
    if env::var_os("COOPFUT_DOUBLE_FULFILL_PANIC").is_some() {
        let sched = Scheduler::new(|| {});
        // A violation misfiled as an ordinary failure would land in one of
        // the clean exits below and fail the parent's assertion.
        sched.set_unexpected_handler(|| process::exit(0));

        let victim = Future::<i32>::new(&sched);
        victim.set_result(1).unwrap();

        let task_victim = victim.clone();
        let fut = sched.spawn(move || {
            if let Err(err) = task_victim.set_result(2) {
                panic::panic_any(err);
            }
        });
        let _ = fut.wait();
        process::exit(0);
    }

    assert_child_aborts(
        "double_fulfill_escaping_a_task_is_fatal",
        "COOPFUT_DOUBLE_FULFILL_PANIC",
    );
}

#[test]
fn double_fulfill_through_the_error_channel_is_fatal() {
    if env::var_os("COOPFUT_DOUBLE_FULFILL_ERROR").is_some() {
        let sched = Scheduler::new(|| {});
        sched.set_unexpected_handler(|| process::exit(0));

        let victim = Future::<i32>::new(&sched);
        victim.set_result(1).unwrap();

        let task_victim = victim.clone();
        let fut = sched.spawn_fallible(move || task_victim.set_result(2).map(|()| 0));
        let _ = fut.wait();
        process::exit(0);
    }

    assert_child_aborts(
        "double_fulfill_through_the_error_channel_is_fatal",
        "COOPFUT_DOUBLE_FULFILL_ERROR",
    );
}

struct CountingAllocator {
    inner: MmapStackAllocator,
    live: Rc<Cell<i32>>,
    total: Rc<Cell<u32>>,
}

unsafe impl StackAllocator for CountingAllocator {
    fn allocate(&mut self, size: usize) -> std::io::Result<StackSpace> {
        self.live.set(self.live.get() + 1);
        self.total.set(self.total.get() + 1);
        self.inner.allocate(size)
    }

    fn deallocate(&mut self, space: StackSpace) {
        self.live.set(self.live.get() - 1);
        self.inner.deallocate(space);
    }
}

#[test]
fn each_wait_takes_exactly_one_stack_and_returns_it() {
    let live = Rc::new(Cell::new(0));
    let total = Rc::new(Cell::new(0));

    let sched = Scheduler::with_stack_allocator(
        || {},
        CountingAllocator {
            inner: MmapStackAllocator,
            live: Rc::clone(&live),
            total: Rc::clone(&total),
        },
        64 * 1024,
    );

    let fut = sched.spawn(|| 5);
    assert_eq!(fut.wait(), Ok(5));

    assert_eq!(total.get(), 1);
    assert_eq!(live.get(), 0);

    // A second blocking wait takes (and returns) a fresh stack.
    let fut = sched.spawn(|| 6);
    assert_eq!(fut.wait(), Ok(6));
    assert_eq!(total.get(), 2);
    assert_eq!(live.get(), 0);
}
