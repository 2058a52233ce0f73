//! Single-threaded readiness dispatcher and the task ownership tree.
//!
//! Tasks are held in a slab of slots; parents own children and destruction
//! cascades. A callback returning `<= 0` has the task killed by its parent
//! (the default parent action: delete it, children included). All sockets
//! are non-blocking; no callback may block.
//!
//! The dispatcher itself is an explicit object threaded through the
//! constructors of everything that needs it. Tests build their own.

use indexmap::IndexSet;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use rtkit::logging::{self, Logger};
use std::io;
use std::mem;
use std::time::{Duration, Instant};

pub type TaskId = usize;

/// Token reserved for the producer wakeup registration.
const WAKE_TOKEN: Token = Token(::std::usize::MAX - 1);

/// A schedulable unit owned by the dispatcher. Return values follow the
/// readiness-callback convention: `> 0` keeps the task alive, `<= 0` asks
/// the parent to kill it.
pub trait Task {
    fn read(&mut self, cx: &mut Context) -> i32 {
        let _ = cx;
        -1
    }

    fn write(&mut self, cx: &mut Context) -> i32 {
        let _ = cx;
        -1
    }

    fn timeout(&mut self, cx: &mut Context) -> i32 {
        let _ = cx;
        -1
    }

    /// Producer wakeup; delivered to tasks in the streaming set.
    fn wake(&mut self, cx: &mut Context) -> i32 {
        let _ = cx;
        1
    }

    /// The pollable object to register under this task's token.
    fn evented(&self) -> Option<&dyn mio::Evented> {
        None
    }

    /// Invoked on the parent after one of its children was destroyed.
    fn child_gone(&mut self, child: TaskId) {
        let _ = child;
    }
}

struct Slot {
    task: Option<Box<dyn Task>>,
    parent: Option<TaskId>,
    children: Vec<TaskId>,
    live: bool,
}

struct TimerEntry {
    task: TaskId,
    deadline: Instant,
    period: Duration,
}

pub struct Dispatcher {
    poll: Poll,
    slots: Vec<Slot>,
    free: Vec<TaskId>,
    timers: Vec<TimerEntry>,
    streaming: IndexSet<TaskId>,

    // Producer wakeup plumbing. The registration must stay alive for as
    // long as the poll is interested in it.
    _wake_registration: Registration,
    wake_readiness: SetReadiness,

    // Tombstone state for a timer whose owner cancels it from inside its
    // own timeout callback: removal is deferred until the callback
    // returns.
    running_timer: Option<TaskId>,
    running_timer_cancelled: bool,

    log: Logger,
}

impl Dispatcher {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> io::Result<Dispatcher> {
        let poll = Poll::new()?;

        let (registration, readiness) = Registration::new2();
        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())?;

        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard_logger(),
        };

        Ok(Dispatcher {
            poll,
            slots: Vec::new(),
            free: Vec::new(),
            timers: Vec::new(),
            streaming: IndexSet::new(),
            _wake_registration: registration,
            wake_readiness: readiness,
            running_timer: None,
            running_timer_cancelled: false,
            log,
        })
    }

    /// Handle the producer thread uses to re-enter the event loop.
    pub fn waker(&self) -> SetReadiness {
        self.wake_readiness.clone()
    }

    /// Allocates a task slot. Registration with the poll is a separate
    /// step because listeners and timer-only tasks have different needs.
    pub fn spawn(&mut self, parent: Option<TaskId>, task: Box<dyn Task>) -> TaskId {
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Slot {
                    task: Some(task),
                    parent,
                    children: Vec::new(),
                    live: true,
                };
                id
            }
            None => {
                self.slots.push(Slot {
                    task: Some(task),
                    parent,
                    children: Vec::new(),
                    live: true,
                });
                self.slots.len() - 1
            }
        };

        if let Some(parent) = parent {
            self.slots[parent].children.push(id);
        }

        logging::trace!(self.log, "task spawned"; "task" => id, "parent" => parent);
        id
    }

    /// Registers the task's fd for readiness events under its own token.
    pub fn register(&mut self, id: TaskId) -> io::Result<()> {
        let task = self.slots[id]
            .task
            .as_ref()
            .expect("cannot register a running task");
        let evented = task.evented().expect("task has nothing to register");

        self.poll.register(
            evented,
            Token(id),
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )
    }

    /// Arms (or replaces) the task's periodic timer.
    pub fn set_timer(&mut self, id: TaskId, period: Duration) {
        self.cancel_timer(id);
        self.timers.push(TimerEntry {
            task: id,
            deadline: Instant::now() + period,
            period,
        });
    }

    pub fn cancel_timer(&mut self, id: TaskId) {
        if self.running_timer == Some(id) {
            // The owner is cancelling from inside its own callback; the
            // entry is still needed until the callback returns.
            self.running_timer_cancelled = true;
            return;
        }

        self.timers.retain(|entry| entry.task != id);
    }

    /// Adds or removes the task from the set woken by the producer.
    pub fn set_streaming(&mut self, id: TaskId, enabled: bool) {
        if enabled {
            self.streaming.insert(id);
        } else {
            self.streaming.swap_remove(&id);
        }
    }

    #[inline]
    pub fn is_live(&self, id: TaskId) -> bool {
        self.slots.get(id).map(|slot| slot.live).unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.live).count()
    }

    /// Destroys a task and its whole subtree: timers disarmed, streaming
    /// membership dropped, fds closed by dropping their owners, parent
    /// notified.
    pub fn kill(&mut self, id: TaskId) {
        if !self.is_live(id) {
            return;
        }

        let children = mem::replace(&mut self.slots[id].children, Vec::new());
        for child in children {
            self.kill(child);
        }

        if self.running_timer == Some(id) {
            self.running_timer_cancelled = true;
        }
        self.timers.retain(|entry| entry.task != id);
        self.streaming.swap_remove(&id);

        let parent = self.slots[id].parent.take();
        // May be None while the task's own callback runs; the put-back in
        // invoke() notices the dead slot and drops the box instead.
        let task = self.slots[id].task.take();
        self.slots[id].live = false;
        self.free.push(id);

        drop(task);

        if let Some(parent) = parent {
            self.slots[parent].children.retain(|&c| c != id);

            if let Some(mut parent_task) = self.slots[parent].task.take() {
                parent_task.child_gone(id);
                self.slots[parent].task = Some(parent_task);
            }
        }

        logging::debug!(self.log, "task destroyed"; "task" => id);
    }

    /// Runs the loop until no tasks remain.
    pub fn run(&mut self) -> io::Result<()> {
        while self.run_once(None)? {}
        Ok(())
    }

    /// One poll-and-dispatch round. Returns false once no live tasks
    /// remain. `max_wait` bounds the poll; timers shorten it further.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<bool> {
        let now = Instant::now();

        let timer_wait = self
            .timers
            .iter()
            .map(|entry| {
                entry
                    .deadline
                    .checked_duration_since(now)
                    .unwrap_or_else(|| Duration::from_millis(0))
            })
            .min();

        let wait = match (timer_wait, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        let mut events = Events::with_capacity(256);
        self.poll.poll(&mut events, wait)?;

        self.fire_timers();

        for event in &events {
            match event.token() {
                WAKE_TOKEN => {
                    // Clear before pumping so a wakeup arriving mid-pump
                    // produces a fresh event.
                    self.wake_readiness.set_readiness(Ready::empty())?;
                    self.pump_streaming();
                }
                Token(id) => {
                    let readiness = event.readiness();

                    if readiness.is_readable() {
                        self.invoke(id, Op::Read);
                    }
                    if readiness.is_writable() {
                        self.invoke(id, Op::Write);
                    }
                }
            }
        }

        Ok(self.live_count() > 0)
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();

        let due: Vec<TaskId> = self
            .timers
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.task)
            .collect();

        for id in due {
            let position = match self.timers.iter().position(|entry| entry.task == id) {
                Some(position) if self.timers[position].deadline <= now => position,
                _ => continue,
            };

            self.running_timer = Some(id);
            self.running_timer_cancelled = false;

            let rv = self.call(id, Op::Timeout);

            self.running_timer = None;

            if !self.is_live(id) {
                continue;
            }

            if rv <= 0 {
                self.kill(id);
                continue;
            }

            if self.running_timer_cancelled {
                self.timers.retain(|entry| entry.task != id);
            } else if let Some(entry) = self.timers.get_mut(position) {
                if entry.task == id {
                    entry.deadline = now + entry.period;
                }
            }
        }
    }

    fn pump_streaming(&mut self) {
        let ids: Vec<TaskId> = self.streaming.iter().cloned().collect();

        for id in ids {
            self.invoke(id, Op::Wake);
        }
    }

    fn invoke(&mut self, id: TaskId, op: Op) {
        if !self.is_live(id) {
            return;
        }

        let rv = self.call(id, op);

        if self.is_live(id) && rv <= 0 {
            self.kill(id);
        }
    }

    /// Takes the task out of its slot for the duration of the callback so
    /// the callback can borrow the dispatcher through its context.
    fn call(&mut self, id: TaskId, op: Op) -> i32 {
        let mut task = match self.slots[id].task.take() {
            Some(task) => task,
            None => return 1,
        };

        let rv = {
            let mut cx = Context {
                dispatcher: self,
                id,
            };

            match op {
                Op::Read => task.read(&mut cx),
                Op::Write => task.write(&mut cx),
                Op::Timeout => task.timeout(&mut cx),
                Op::Wake => task.wake(&mut cx),
            }
        };

        if self.slots[id].live {
            self.slots[id].task = Some(task);
        }
        // A dead slot means the task was killed during its own callback;
        // dropping the box here closes its resources.

        rv
    }
}

#[derive(Copy, Clone)]
enum Op {
    Read,
    Write,
    Timeout,
    Wake,
}

/// The dispatcher's face towards a task while one of its callbacks runs.
pub struct Context<'a> {
    dispatcher: &'a mut Dispatcher,
    id: TaskId,
}

impl<'a> Context<'a> {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Spawns a child of the running task and registers its fd.
    pub fn spawn_child(&mut self, task: Box<dyn Task>) -> io::Result<TaskId> {
        let id = self.dispatcher.spawn(Some(self.id), task);

        if let Err(error) = self.dispatcher.register(id) {
            self.dispatcher.kill(id);
            return Err(error);
        }

        Ok(id)
    }

    /// Spawns a child without fd registration (timer-only tasks).
    pub fn spawn_plain_child(&mut self, task: Box<dyn Task>) -> TaskId {
        self.dispatcher.spawn(Some(self.id), task)
    }

    pub fn kill(&mut self, id: TaskId) {
        debug_assert_ne!(id, self.id, "return <= 0 to terminate the running task");
        self.dispatcher.kill(id);
    }

    pub fn set_timer(&mut self, period: Duration) {
        self.dispatcher.set_timer(self.id, period);
    }

    /// Arms a timer on another task, typically a freshly spawned child.
    pub fn set_timer_for(&mut self, id: TaskId, period: Duration) {
        self.dispatcher.set_timer(id, period);
    }

    pub fn cancel_timer(&mut self) {
        self.dispatcher.cancel_timer(self.id);
    }

    pub fn set_streaming(&mut self, enabled: bool) {
        self.dispatcher.set_streaming(self.id, enabled);
    }
}
