//! Per-thread job queues.
//!
//! Every session is owned by one thread and all work on it is submitted
//! through that thread's [`Dispatcher`]. A thread gets a queue either by
//! being spawned as a [`WorkerThread`] or by binding itself with
//! [`Dispatcher::for_current_thread`], which returns a [`RunLoop`] the
//! thread pumps itself.
//!
//! A dispatcher thread that blocks in [`Dispatcher::perform_and_wait`]
//! keeps running jobs from its own queue until the reply arrives, so two
//! dispatcher threads waiting on each other make progress.
//!
//! The blocking calls must not be made from inside an async runtime.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError as QueueError};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, error, warn};

use cascade_types::ThreadToken;

use crate::error::{SessionError, SessionResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    /// Nudges a waiting thread to re-check its pending reply.
    Wake,
    Shutdown,
}

struct Inner {
    token: ThreadToken,
    name: String,
    sender: mpsc::UnboundedSender<Message>,
}

/// Cloneable handle to one thread's job queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// The receiving end of the queue, owned by the bound thread.
struct BoundQueue {
    dispatcher: Dispatcher,
    inbox: mpsc::UnboundedReceiver<Message>,
    stopping: bool,
}

thread_local! {
    static BOUND: RefCell<Option<BoundQueue>> = const { RefCell::new(None) };
}

impl Dispatcher {
    fn from_parts(token: ThreadToken, name: String, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                name,
                sender,
            }),
        }
    }

    /// Spawn a dedicated worker thread with its own queue.
    pub fn spawn_worker(name: impl Into<String>) -> SessionResult<WorkerThread> {
        WorkerThread::spawn(name)
    }

    /// Bind the calling thread to a new queue.
    ///
    /// The thread must pump the returned [`RunLoop`] for queued work to run.
    pub fn for_current_thread(name: impl Into<String>) -> SessionResult<RunLoop> {
        let token = ThreadToken::current();
        if Self::current().is_some() {
            return Err(SessionError::AlreadyBound(token));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self::from_parts(token, name.into(), tx);
        bind(dispatcher.clone(), rx);
        debug!(dispatcher = %dispatcher.name(), "bound current thread");
        Ok(RunLoop {
            dispatcher,
            _not_send: PhantomData,
        })
    }

    /// The dispatcher bound to the calling thread, if any.
    pub fn current() -> Option<Dispatcher> {
        BOUND.with(|b| b.borrow().as_ref().map(|q| q.dispatcher.clone()))
    }

    pub fn token(&self) -> ThreadToken {
        self.inner.token
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns `true` if the caller is the thread this dispatcher runs on.
    pub fn is_current(&self) -> bool {
        self.inner.token.is_current()
    }

    /// Returns `true` while the owning thread still accepts work.
    pub fn is_alive(&self) -> bool {
        !self.inner.sender.is_closed()
    }

    /// Enqueue a job. Never blocks and never runs the job inline.
    pub fn perform<F>(&self, job: F) -> SessionResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| self.closed())
    }

    /// Run `f` on the owning thread and wait for its result.
    ///
    /// Runs inline when called from the owning thread. A job that panics
    /// is reported as [`SessionError::DispatcherClosed`].
    pub fn perform_and_wait<T, F>(&self, f: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }

        let (tx, mut rx) = oneshot::channel();
        let waiter = Self::current();
        let servicing = waiter.is_some();
        let reply = Reply {
            tx: Some(tx),
            waiter,
        };
        self.perform(move || reply.send(f()))?;

        if !servicing {
            return rx.blocking_recv().map_err(|_| self.closed());
        }

        loop {
            match rx.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Closed) => return Err(self.closed()),
                Err(TryRecvError::Empty) => {}
            }
            match next_message(true) {
                Some(Message::Run(job)) => run_job(job),
                Some(Message::Wake) => {}
                Some(Message::Shutdown) => mark_stopping(),
                None => return Err(self.closed()),
            }
        }
    }

    fn closed(&self) -> SessionError {
        SessionError::DispatcherClosed {
            name: self.inner.name.clone(),
        }
    }
}

impl PartialEq for Dispatcher {
    fn eq(&self, other: &Self) -> bool {
        self.inner.token == other.inner.token
    }
}

impl Eq for Dispatcher {}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("token", &self.inner.token)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Carries a result back to a waiting caller.
///
/// Dropping it, sent or not, wakes the waiter so it never sleeps on a
/// reply that will not come.
struct Reply<T> {
    tx: Option<oneshot::Sender<T>>,
    waiter: Option<Dispatcher>,
}

impl<T> Reply<T> {
    fn send(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(value);
        }
    }
}

impl<T> Drop for Reply<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(waiter) = &self.waiter {
            let _ = waiter.inner.sender.send(Message::Wake);
        }
    }
}

fn bind(dispatcher: Dispatcher, inbox: mpsc::UnboundedReceiver<Message>) {
    BOUND.with(|b| {
        *b.borrow_mut() = Some(BoundQueue {
            dispatcher,
            inbox,
            stopping: false,
        })
    });
}

fn unbind() {
    // Dropped outside the borrow: queued jobs may own reply guards.
    let queue = BOUND.with(|b| b.borrow_mut().take());
    drop(queue);
}

fn next_message(block: bool) -> Option<Message> {
    BOUND.with(|b| {
        let mut bound = b.borrow_mut();
        let queue = bound.as_mut()?;
        if block {
            queue.inbox.blocking_recv()
        } else {
            match queue.inbox.try_recv() {
                Ok(msg) => Some(msg),
                Err(QueueError::Empty) | Err(QueueError::Disconnected) => None,
            }
        }
    })
}

fn mark_stopping() {
    BOUND.with(|b| {
        if let Some(queue) = b.borrow_mut().as_mut() {
            queue.stopping = true;
        }
    });
}

fn is_stopping() -> bool {
    BOUND.with(|b| b.borrow().as_ref().map_or(true, |q| q.stopping))
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(
            thread = thread::current().name().unwrap_or("<unnamed>"),
            "dispatched job panicked"
        );
    }
}

/// A thread spawned to serve one dispatcher.
///
/// Shut down explicitly or on drop; jobs still queued at that point are
/// dropped and their waiters see [`SessionError::DispatcherClosed`].
pub struct WorkerThread {
    dispatcher: Dispatcher,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn spawn(name: impl Into<String>) -> SessionResult<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let thread_name = name.clone();
        let thread_tx = tx.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let dispatcher = Dispatcher::from_parts(ThreadToken::current(), thread_name, thread_tx);
            bind(dispatcher, rx);
            while !is_stopping() {
                match next_message(true) {
                    Some(Message::Run(job)) => run_job(job),
                    Some(Message::Wake) => {}
                    Some(Message::Shutdown) | None => break,
                }
            }
            unbind();
        })?;

        let token = ThreadToken::from(handle.thread().id());
        debug!(worker = %name, "spawned worker thread");
        Ok(Self {
            dispatcher: Dispatcher::from_parts(token, name, tx),
            handle: Some(handle),
        })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Stop the thread after the job it is running and wait for it to exit.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.dispatcher.inner.sender.send(Message::Shutdown);
        if self.dispatcher.is_current() {
            // Joining ourselves would never return.
            return;
        }
        if handle.join().is_err() {
            warn!(worker = %self.dispatcher.name(), "worker thread panicked");
        } else {
            debug!(worker = %self.dispatcher.name(), "worker thread stopped");
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerThread")
            .field("dispatcher", &self.dispatcher)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

/// Queue binding for a thread that runs its own loop, such as the
/// primary thread. Dropping it unbinds the thread.
pub struct RunLoop {
    dispatcher: Dispatcher,
    _not_send: PhantomData<*const ()>,
}

impl RunLoop {
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Run every job queued so far. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(msg) = next_message(false) {
            if let Message::Run(job) = msg {
                run_job(job);
                ran += 1;
            }
        }
        ran
    }

    /// Pump the queue until `done` holds or `timeout` elapses. Returns
    /// whether `done` held.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        if self.dispatcher.is_current() {
            unbind();
        }
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
