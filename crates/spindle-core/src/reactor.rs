//! The readiness-based event loop.
//!
//! One [`Reactor`] instance means one dedicated thread running a
//! single-threaded cooperative loop; there is no intra-reactor parallelism.
//! Each tick executes due tasks, then performs one readiness-selection pass
//! over every attached connection and dispatches write, read, and error
//! events — in that order, so buffered responses flush promptly.
//!
//! # Ownership
//!
//! All mutation of the connection registry and of any connection's buffers
//! happens on the owning thread. Foreign threads interact exclusively
//! through [`Handle::schedule`], which enqueues a closure and wakes the
//! poller; the closure runs at the start of a future tick, in submission
//! order. Code already on the reactor thread holds `&mut Reactor` and simply
//! calls methods directly — [`Reactor::schedule`] runs its closure
//! synchronously.
//!
//! # Failure semantics
//!
//! Errors and panics raised inside task bodies or connection callbacks are
//! caught per dispatch, forwarded to registered error handlers as
//! [`ReactorFault`]s, and (for connection callbacks) close the offending
//! connection. They never abort the loop. Errors from `run_with`'s init
//! block propagate to the caller.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionHandler, Endpoint, Role};
use crate::error::{ConnectionError, ReactorError};
use crate::task::{Task, TaskId, TaskList};

/// Reserved token for the cross-thread waker.
const WAKER: Token = Token(0);

const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// A fault caught at a task or callback boundary and routed to error
/// handlers instead of aborting the loop.
#[derive(Debug)]
pub enum ReactorFault {
    /// A task body panicked.
    TaskPanic { message: String },
    /// A connection callback returned an error.
    CallbackError { peer: String, message: String },
    /// A connection callback panicked.
    CallbackPanic { peer: String, message: String },
}

impl std::fmt::Display for ReactorFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskPanic { message } => write!(f, "task panicked: {message}"),
            Self::CallbackError { peer, message } => {
                write!(f, "callback error on {peer}: {message}")
            }
            Self::CallbackPanic { peer, message } => {
                write!(f, "callback panic on {peer}: {message}")
            }
        }
    }
}

type Injected = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

struct Shared {
    owner: Mutex<Option<ThreadId>>,
    injected: Mutex<VecDeque<Injected>>,
    waker: Waker,
    /// Set at teardown: closures scheduled against a retired reactor are
    /// dropped instead of queueing forever (dropping them releases whatever
    /// completion channels they hold).
    retired: std::sync::atomic::AtomicBool,
}

/// Cloneable, `Send` handle to a reactor — the single legal way for other
/// threads to touch reactor-owned state.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Enqueue `f` to run on the reactor thread at the start of a future
    /// tick. Wakes the poller if it is sleeping. Closures submitted from one
    /// thread run in submission order.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        if self.shared.retired.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        self.shared.injected.lock().push_back(Box::new(f));
        let _ = self.shared.waker.wake();
    }

    /// Request a cooperative stop, observed at the top of a future tick.
    pub fn stop(&self) {
        self.schedule(|reactor| reactor.stop());
    }

    pub fn is_running(&self) -> bool {
        self.shared.owner.lock().is_some()
    }

    /// True when the calling thread is the one running the reactor loop.
    pub fn is_owner(&self) -> bool {
        *self.shared.owner.lock() == Some(thread::current().id())
    }

    /// Append bytes to a connection's write buffer from any thread.
    pub fn write_to(&self, token: Token, data: Vec<u8>) {
        self.schedule(move |reactor| reactor.write(token, &data));
    }

    /// Close a connection from any thread.
    pub fn close(&self, token: Token, reason: Option<ConnectionError>) {
        self.schedule(move |reactor| reactor.close_connection(token, reason));
    }
}

/// Borrowed view a connection callback gets: its own connection plus the
/// reactor that owns it.
pub struct ConnectionCtx<'a> {
    reactor: &'a mut Reactor,
    token: Token,
}

impl ConnectionCtx<'_> {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn reactor(&mut self) -> &mut Reactor {
        self.reactor
    }

    pub fn handle(&self) -> Handle {
        self.reactor.handle()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.reactor
            .connections
            .get(&self.token)
            .map(|c| c.endpoint().clone())
    }

    /// Append bytes to this connection's write buffer. Never blocks; the
    /// reactor flushes on subsequent ticks.
    pub fn write(&mut self, data: &[u8]) {
        self.reactor.write(self.token, data);
    }

    /// Request a close. Deferred until the current callback returns so
    /// `on_close` still fires exactly once, after the in-flight dispatch.
    pub fn close(&mut self, reason: Option<ConnectionError>) {
        self.reactor.close_connection(self.token, reason);
    }
}

/// The event loop: a connection registry, task lists, and one OS poller.
pub struct Reactor {
    poll: Poll,
    events: Events,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    tasks: TaskList,
    next_task_id: u64,
    error_handlers: Vec<Box<dyn FnMut(&ReactorFault) + 'static>>,
    shutdown_tasks: Vec<Box<dyn FnOnce(&mut Reactor) + 'static>>,
    shared: Arc<Shared>,
    ticks: u64,
    running: bool,
    stop_requested: bool,
    select_timeout: Duration,
    tick_interval: Duration,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            connections: HashMap::new(),
            next_token: WAKER.0 + 1,
            tasks: TaskList::default(),
            next_task_id: 0,
            error_handlers: Vec::new(),
            shutdown_tasks: Vec::new(),
            shared: Arc::new(Shared {
                owner: Mutex::new(None),
                injected: Mutex::new(VecDeque::new()),
                waker,
                retired: std::sync::atomic::AtomicBool::new(false),
            }),
            ticks: 0,
            running: false,
            stop_requested: false,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        })
    }

    /// Spawn a dedicated thread running a fresh reactor until it is
    /// stopped. The reactor is built on that thread and never leaves it —
    /// task bodies stay free to hold thread-local state — so the returned
    /// [`Handle`] is the only way in from outside.
    pub fn spawn(name: &str) -> io::Result<(Handle, std::thread::JoinHandle<()>)> {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut reactor = match Reactor::new() {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(Ok(reactor.handle()));
                if let Err(e) = reactor.run() {
                    warn!(error = %e, "reactor terminated with error");
                }
            })?;
        match rx.recv() {
            Ok(Ok(handle)) => Ok((handle, thread)),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                "reactor thread exited before startup",
            )),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Upper bound on one readiness-selection wait while connections exist.
    pub fn set_select_timeout(&mut self, timeout: Duration) {
        self.select_timeout = timeout;
    }

    /// Idle wait per tick while no connections are attached.
    pub fn set_tick_interval(&mut self, interval: Duration) {
        self.tick_interval = interval;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, token: Token) -> Option<&Connection> {
        self.connections.get(&token)
    }

    /// Run the loop until [`stop`](Self::stop) is observed. `init` runs
    /// first, already owning the reactor; its error propagates to the
    /// caller. Fails with [`ReactorError::AlreadyRunning`] when the loop is
    /// live on any thread.
    pub fn run_with<F>(&mut self, init: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&mut Reactor) -> Result<(), ReactorError>,
    {
        {
            let mut owner = self.shared.owner.lock();
            if owner.is_some() {
                return Err(ReactorError::AlreadyRunning);
            }
            *owner = Some(thread::current().id());
        }
        self.running = true;
        self.stop_requested = false;
        self.shared
            .retired
            .store(false, std::sync::atomic::Ordering::Release);
        debug!("reactor starting");
        let result = match init(self) {
            Ok(()) => self.run_loop(),
            Err(e) => Err(e),
        };
        self.teardown();
        debug!("reactor stopped");
        result
    }

    pub fn run(&mut self) -> Result<(), ReactorError> {
        self.run_with(|_| Ok(()))
    }

    fn run_loop(&mut self) -> Result<(), ReactorError> {
        loop {
            self.drain_injected();
            self.fire_due_tasks();
            if self.stop_requested {
                break;
            }
            // Foreign-thread work submitted during task execution still runs
            // before this tick's readiness pass.
            self.drain_injected();
            self.readiness_pass()?;
            self.ticks = self.ticks.wrapping_add(1);
        }
        Ok(())
    }

    /// Flip the stop flag; consumed at the top of the next loop iteration.
    /// In-flight work finishes first — cancellation is cooperative.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Run `f` now. This is the same-thread form of [`Handle::schedule`]:
    /// holding `&mut Reactor` proves the caller is on the owning thread, so
    /// the body executes synchronously instead of being queued.
    pub fn schedule<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Reactor),
    {
        f(self)
    }

    fn teardown(&mut self) {
        self.tasks.clear();
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, None);
        }
        let shutdown = std::mem::take(&mut self.shutdown_tasks);
        for hook in shutdown {
            hook(self);
        }
        self.shared
            .retired
            .store(true, std::sync::atomic::Ordering::Release);
        self.shared.injected.lock().clear();
        self.error_handlers.clear();
        self.running = false;
        self.stop_requested = false;
        *self.shared.owner.lock() = None;
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), ReactorError> {
        if self.running {
            Ok(())
        } else {
            Err(ReactorError::NotRunning)
        }
    }

    fn alloc_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        TaskId(self.next_task_id)
    }

    /// One-off task for the next tick.
    pub fn next_tick<F>(&mut self, f: F) -> Result<TaskId, ReactorError>
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        self.ensure_running()?;
        let id = self.alloc_task_id();
        let mut f = Some(f);
        self.tasks.push(Task::one_off(
            id,
            Box::new(move |reactor| {
                if let Some(f) = f.take() {
                    f(reactor)
                }
            }),
        ));
        Ok(id)
    }

    /// Persistent task firing every tick until removed.
    pub fn on_tick<F>(&mut self, f: F) -> Result<TaskId, ReactorError>
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.ensure_running()?;
        let id = self.alloc_task_id();
        self.tasks.push(Task::persistent(id, Box::new(f)));
        Ok(id)
    }

    /// Periodic task; accuracy is best-effort (tick granularity).
    pub fn at_interval<F>(&mut self, interval: Duration, f: F) -> Result<TaskId, ReactorError>
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.ensure_running()?;
        let id = self.alloc_task_id();
        self.tasks
            .push(Task::periodic(id, interval, Instant::now(), Box::new(f)));
        Ok(id)
    }

    /// Delayed one-shot task.
    pub fn delay<F>(&mut self, delay: Duration, f: F) -> Result<TaskId, ReactorError>
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        self.ensure_running()?;
        let id = self.alloc_task_id();
        let mut f = Some(f);
        self.tasks.push(Task::delayed(
            id,
            delay,
            Instant::now(),
            Box::new(move |reactor| {
                if let Some(f) = f.take() {
                    f(reactor)
                }
            }),
        ));
        Ok(id)
    }

    /// Hook run after the loop exits, in registration order.
    pub fn on_shutdown<F>(&mut self, f: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        self.ensure_running()?;
        self.shutdown_tasks.push(Box::new(f));
        Ok(())
    }

    /// Register an error handler. Handlers observe every caught fault.
    pub fn on_error<F>(&mut self, f: F) -> Result<(), ReactorError>
    where
        F: FnMut(&ReactorFault) + 'static,
    {
        self.ensure_running()?;
        self.error_handlers.push(Box::new(f));
        Ok(())
    }

    pub fn remove_task(&mut self, id: TaskId) -> bool {
        self.tasks.remove(id)
    }

    fn drain_injected(&mut self) {
        loop {
            let batch: Vec<Injected> = {
                let mut queue = self.shared.injected.lock();
                if queue.is_empty() {
                    break;
                }
                queue.drain(..).collect()
            };
            for f in batch {
                f(self);
            }
        }
    }

    fn fire_due_tasks(&mut self) {
        let now = Instant::now();
        let snapshot = self.tasks.take_entries();
        let mut survivors = Vec::with_capacity(snapshot.len());
        for mut task in snapshot {
            if self.tasks.is_removed(task.id) {
                continue;
            }
            if task.due(now) {
                let result = catch_unwind(AssertUnwindSafe(|| (task.body)(self)));
                if let Err(payload) = result {
                    self.report_fault(ReactorFault::TaskPanic {
                        message: panic_message(payload),
                    });
                }
                if !task.keep_after_fire(Instant::now()) {
                    continue;
                }
            }
            survivors.push(task);
        }
        self.tasks.absorb_front(survivors);
    }

    fn report_fault(&mut self, fault: ReactorFault) {
        warn!(%fault, "reactor fault");
        // Swap handlers out so a handler registering another handler does
        // not invalidate the iteration.
        let mut handlers = std::mem::take(&mut self.error_handlers);
        for handler in &mut handlers {
            handler(&fault);
        }
        let added = std::mem::take(&mut self.error_handlers);
        handlers.extend(added);
        self.error_handlers = handlers;
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Register a connection and begin driving it. Fires `on_attach`, and
    /// `on_connect` as soon as the transport is ready.
    pub fn attach(&mut self, mut conn: Connection) -> Result<Token, ConnectionError> {
        let token = Token(self.next_token);
        self.next_token += 1;
        conn.token = Some(token);
        conn.register(self.poll.registry(), token)
            .map_err(ConnectionError::Io)?;
        debug!(peer = %conn.endpoint(), role = ?conn.role(), token = token.0, "attached");
        self.connections.insert(token, conn);
        self.dispatch(token, |handler, ctx| handler.on_attach(ctx));
        self.maybe_fire_connect(token);
        Ok(token)
    }

    /// Remove a connection without closing rites beyond `on_detach`.
    /// Idempotent.
    pub fn detach(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        conn.deregister(self.poll.registry());
        if let Some(mut handler) = conn.handler.take() {
            let mut ctx = ConnectionCtx {
                reactor: self,
                token,
            };
            let _ = catch_unwind(AssertUnwindSafe(|| handler.on_detach(&mut ctx)));
        }
    }

    /// Append bytes to a connection's write buffer. No-op once closed.
    pub fn write(&mut self, token: Token, data: &[u8]) {
        let result = match self.connections.get_mut(&token) {
            Some(conn) => conn.queue_write(data),
            None => return,
        };
        if let Err(e) = result {
            self.close_connection(token, Some(e));
        }
    }

    /// Close a connection: fire `on_close(reason)` exactly once, release the
    /// socket, remove any UNIX socket file, and detach. Idempotent. Called
    /// while one of the connection's own callbacks is on the stack, the
    /// close is deferred until that dispatch unwinds.
    pub fn close_connection(&mut self, token: Token, reason: Option<ConnectionError>) {
        if let Some(conn) = self.connections.get_mut(&token) {
            if conn.in_dispatch {
                conn.close_requested = true;
                conn.close_reason = reason;
                return;
            }
        }
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        conn.closed = true;
        conn.deregister(self.poll.registry());
        conn.unlink_unix_socket();
        debug!(peer = %conn.endpoint(), reason = ?reason, "closed");
        if let Some(mut handler) = conn.handler.take() {
            let mut ctx = ConnectionCtx {
                reactor: self,
                token,
            };
            let _ = catch_unwind(AssertUnwindSafe(|| {
                handler.on_close(&mut ctx, reason.as_ref());
                handler.on_detach(&mut ctx);
            }));
        }
    }

    /// Take a callback's requested close into effect once its dispatch has
    /// unwound.
    fn finish_requested_close(&mut self, token: Token) {
        let reason = match self.connections.get_mut(&token) {
            Some(conn) if conn.close_requested => {
                conn.close_requested = false;
                conn.close_reason.take()
            }
            _ => return,
        };
        self.close_connection(token, reason);
    }

    /// Run one handler callback with the connection's context, catching
    /// errors and panics at the boundary.
    fn dispatch<F>(&mut self, token: Token, f: F)
    where
        F: FnOnce(&mut dyn ConnectionHandler, &mut ConnectionCtx<'_>) -> Result<(), ConnectionError>,
    {
        let (mut handler, peer) = match self.connections.get_mut(&token) {
            Some(conn) => match conn.handler.take() {
                Some(handler) => {
                    conn.in_dispatch = true;
                    (handler, conn.endpoint().to_string())
                }
                None => return,
            },
            None => return,
        };
        let result = {
            let mut ctx = ConnectionCtx {
                reactor: self,
                token,
            };
            catch_unwind(AssertUnwindSafe(|| f(handler.as_mut(), &mut ctx)))
        };
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.handler = Some(handler);
            conn.in_dispatch = false;
        }
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.report_fault(ReactorFault::CallbackError {
                    peer,
                    message: e.to_string(),
                });
                self.close_connection(token, Some(e));
            }
            Err(payload) => {
                let message = panic_message(payload);
                self.report_fault(ReactorFault::CallbackPanic {
                    peer,
                    message: message.clone(),
                });
                self.close_connection(
                    token,
                    Some(ConnectionError::Usage(format!("handler panicked: {message}"))),
                );
            }
        }
        self.finish_requested_close(token);
    }

    fn maybe_fire_connect(&mut self, token: Token) {
        let fire = match self.connections.get_mut(&token) {
            Some(conn)
                if conn.role() != Role::Listener
                    && !conn.connect_notified
                    && conn.ready_for_handler() =>
            {
                conn.connect_notified = true;
                true
            }
            _ => false,
        };
        if fire {
            self.dispatch(token, |handler, ctx| handler.on_connect(ctx));
        }
    }

    // ------------------------------------------------------------------
    // Readiness pass
    // ------------------------------------------------------------------

    fn readiness_pass(&mut self) -> Result<(), ReactorError> {
        // Attempt pending connects first: some platforms never signal an
        // immediately-completed local connect through the poller.
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.advance_connect(token);
        }

        self.sync_interests();

        let timeout = self.poll_timeout();
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(ReactorError::Io(e));
        }

        // Snapshot the ready set, then handle writes before reads before
        // errors across all ready connections.
        let mut ready: Vec<(Token, bool, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKER {
                continue;
            }
            trace!(token = event.token().0, readable = event.is_readable(),
                   writable = event.is_writable(), "ready");
            ready.push((
                event.token(),
                event.is_readable() || event.is_read_closed(),
                event.is_writable(),
                event.is_error(),
            ));
        }
        for &(token, _, writable, _) in &ready {
            if writable {
                self.handle_writable(token);
            }
        }
        for &(token, readable, _, _) in &ready {
            if readable {
                self.handle_readable(token);
            }
        }
        for &(token, _, _, errored) in &ready {
            if errored {
                self.handle_errored(token);
            }
        }
        Ok(())
    }

    fn poll_timeout(&self) -> Duration {
        let base = if self.connections.is_empty() {
            self.tick_interval
        } else {
            self.select_timeout
        };
        match self.tasks.next_deadline() {
            Some(deadline) => base.min(deadline.saturating_duration_since(Instant::now())),
            None => base,
        }
    }

    fn advance_connect(&mut self, token: Token) {
        let result = match self.connections.get_mut(&token) {
            Some(conn) if !conn.closed => conn.try_finish_connect(),
            _ => return,
        };
        match result {
            // Also delivers deferred `on_connect` for TLS sessions that
            // finished handshaking and for immediately-connected sockets.
            Ok(_) => self.maybe_fire_connect(token),
            Err(e) => self.close_connection(token, Some(e)),
        }
    }

    fn sync_interests(&mut self) {
        let registry = self.poll.registry();
        for (token, conn) in self.connections.iter_mut() {
            if conn.closed {
                continue;
            }
            if let Err(e) = conn.sync_interest(registry, *token) {
                warn!(peer = %conn.endpoint(), error = %e, "interest update failed");
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let connected = match self.connections.get(&token) {
            Some(conn) if !conn.closed => conn.is_connected(),
            _ => return,
        };
        if !connected {
            self.advance_connect(token);
            return;
        }
        let outcome = match self.connections.get_mut(&token) {
            Some(conn) => conn.do_write(),
            None => return,
        };
        if outcome.flushed > 0 {
            let flushed = outcome.flushed;
            self.dispatch(token, move |handler, ctx| handler.on_write(ctx, flushed));
        }
        if outcome.emptied {
            self.dispatch(token, |handler, ctx| handler.on_flush(ctx));
        }
        if let Some(e) = outcome.error {
            self.close_connection(token, Some(e));
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let role = match self.connections.get(&token) {
            Some(conn) if !conn.closed => conn.role(),
            _ => return,
        };
        if role == Role::Listener {
            self.handle_accept(token);
            return;
        }
        let outcome = match self.connections.get_mut(&token) {
            Some(conn) => conn.do_read(),
            None => return,
        };
        if outcome.became_ready {
            self.maybe_fire_connect(token);
        }
        if !outcome.data.is_empty() {
            let data = outcome.data;
            self.dispatch(token, move |handler, ctx| handler.on_read(ctx, &data));
        }
        if let Some(e) = outcome.error {
            self.close_connection(token, Some(e));
        } else if outcome.eof {
            self.close_connection(token, None);
        }
    }

    fn handle_accept(&mut self, token: Token) {
        let (accepted, error) = match self.connections.get_mut(&token) {
            Some(conn) => conn.accept_pending(),
            None => return,
        };
        for conn in accepted {
            let peer = conn.endpoint().to_string();
            if let Err(e) = self.attach(conn) {
                self.report_fault(ReactorFault::CallbackError {
                    peer,
                    message: e.to_string(),
                });
            }
        }
        // Accept failures are usually transient (e.g. descriptor
        // exhaustion); the listener stays attached.
        if let Some(e) = error {
            let peer = self
                .connections
                .get(&token)
                .map(|c| c.endpoint().to_string())
                .unwrap_or_default();
            self.report_fault(ReactorFault::CallbackError {
                peer,
                message: e.to_string(),
            });
        }
    }

    fn handle_errored(&mut self, token: Token) {
        let (reason, peer) = match self.connections.get_mut(&token) {
            Some(conn) if !conn.closed => {
                (conn.take_socket_error(), conn.endpoint().to_string())
            }
            _ => return,
        };
        let reason = reason.unwrap_or(ConnectionError::Reset(peer));
        self.close_connection(token, Some(reason));
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandler;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn watchdog(reactor: &mut Reactor) {
        // Safety net so a broken loop fails the test instead of hanging it.
        reactor
            .delay(Duration::from_secs(5), |r| {
                r.stop();
                panic!("watchdog fired");
            })
            .unwrap();
    }

    #[test]
    fn run_while_running_fails() {
        let mut reactor = Reactor::new().unwrap();
        reactor
            .run_with(|r| {
                assert!(matches!(r.run(), Err(ReactorError::AlreadyRunning)));
                r.stop();
                Ok(())
            })
            .unwrap();
        // Ownership released: a second run works.
        reactor
            .run_with(|r| {
                r.stop();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn task_constructors_require_a_running_reactor() {
        let mut reactor = Reactor::new().unwrap();
        assert!(matches!(
            reactor.next_tick(|_| {}),
            Err(ReactorError::NotRunning)
        ));
        assert!(matches!(
            reactor.at_interval(Duration::from_millis(1), |_| {}),
            Err(ReactorError::NotRunning)
        ));
        assert!(matches!(reactor.on_error(|_| {}), Err(ReactorError::NotRunning)));
    }

    #[test]
    fn one_off_fires_once_then_leaves() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut reactor = Reactor::new().unwrap();
        let seen = count.clone();
        reactor
            .run_with(move |r| {
                let seen = seen.clone();
                r.next_tick(move |r| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    // Give the loop more ticks to prove the task is gone.
                    r.delay(Duration::from_millis(30), |r| r.stop()).unwrap();
                })?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persistent_fires_every_tick_until_removed() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut reactor = Reactor::new().unwrap();
        let seen = count.clone();
        reactor
            .run_with(move |r| {
                let seen = seen.clone();
                r.on_tick(move |r| {
                    if seen.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        r.stop();
                    }
                })?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn periodic_fires_within_tolerance() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut reactor = Reactor::new().unwrap();
        let seen = count.clone();
        reactor
            .run_with(move |r| {
                let seen = seen.clone();
                r.at_interval(Duration::from_millis(50), move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })?;
                r.delay(Duration::from_millis(225), |r| r.stop())?;
                Ok(())
            })
            .unwrap();
        // Nominal 4 fires in 225ms at 50ms; tick accuracy is best-effort.
        let fired = count.load(Ordering::SeqCst);
        assert!((3..=4).contains(&fired), "fired {fired} times");
    }

    #[test]
    fn spawned_reactor_is_driven_entirely_through_its_handle() {
        let (handle, thread) = Reactor::spawn("test-reactor").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle.schedule(move |_| flag.store(true, Ordering::SeqCst));
        handle.stop();
        thread.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(!handle.is_running());
    }

    #[test]
    fn foreign_thread_schedule_runs_on_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let joiner = std::thread::spawn(move || {
            // May land before the loop starts; the injected queue survives
            // until the first tick drains it.
            handle.schedule(move |r| {
                flag.store(true, Ordering::SeqCst);
                r.stop();
            });
        });

        reactor.run().unwrap();
        joiner.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn task_panic_feeds_error_handlers_and_loop_survives() {
        let faults = Arc::new(AtomicUsize::new(0));
        let mut reactor = Reactor::new().unwrap();
        let seen = faults.clone();
        reactor
            .run_with(move |r| {
                let seen = seen.clone();
                r.on_error(move |fault| {
                    assert!(matches!(fault, ReactorFault::TaskPanic { .. }));
                    seen.fetch_add(1, Ordering::SeqCst);
                })?;
                r.next_tick(|_| panic!("boom"))?;
                // Runs after the panic: proves the loop survived.
                r.delay(Duration::from_millis(20), |r| r.stop())?;
                Ok(())
            })
            .unwrap();
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_hooks_run_after_loop_exit() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut reactor = Reactor::new().unwrap();
        let log = order.clone();
        reactor
            .run_with(move |r| {
                let a = log.clone();
                let b = log.clone();
                r.on_shutdown(move |_| a.lock().push("first"))?;
                r.on_shutdown(move |_| b.lock().push("second"))?;
                r.stop();
                Ok(())
            })
            .unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn init_error_propagates() {
        let mut reactor = Reactor::new().unwrap();
        let result = reactor.run_with(|_| Err(ReactorError::NotRunning));
        assert!(matches!(result, Err(ReactorError::NotRunning)));
        assert!(!reactor.is_running());
    }

    // A listener that echoes everything back, and a client that sends one
    // probe and closes after the echo returns.

    struct EchoBack;

    impl ConnectionHandler for EchoBack {
        fn on_read(
            &mut self,
            ctx: &mut ConnectionCtx<'_>,
            data: &[u8],
        ) -> Result<(), ConnectionError> {
            ctx.write(data);
            Ok(())
        }
    }

    struct Probe {
        received: Arc<parking_lot::Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
    }

    impl ConnectionHandler for Probe {
        fn on_connect(&mut self, ctx: &mut ConnectionCtx<'_>) -> Result<(), ConnectionError> {
            ctx.write(b"ping over the loop");
            Ok(())
        }

        fn on_read(
            &mut self,
            ctx: &mut ConnectionCtx<'_>,
            data: &[u8],
        ) -> Result<(), ConnectionError> {
            let mut received = self.received.lock();
            received.extend_from_slice(data);
            if received.len() >= b"ping over the loop".len() {
                ctx.close(None);
                ctx.reactor().stop();
            }
            Ok(())
        }

        fn on_close(&mut self, _ctx: &mut ConnectionCtx<'_>, reason: Option<&ConnectionError>) {
            assert!(reason.is_none(), "clean close expected, got {reason:?}");
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn loopback_echo_round_trip() {
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let mut reactor = Reactor::new().unwrap();

        let received_in = received.clone();
        let closed_in = closed.clone();
        reactor
            .run_with(move |r| {
                watchdog(r);
                let listener = Connection::listen_tcp(
                    "127.0.0.1",
                    0,
                    Box::new(|_| Box::new(EchoBack) as Box<dyn ConnectionHandler>),
                )
                .expect("bind");
                let port = listener.local_addr().unwrap().port();
                r.attach(listener).expect("attach listener");

                let probe = Probe {
                    received: received_in.clone(),
                    closed: closed_in.clone(),
                };
                let client = Connection::connect_tcp("127.0.0.1", port, Box::new(probe))
                    .expect("connect");
                r.attach(client).expect("attach client");
                Ok(())
            })
            .unwrap();

        assert_eq!(&*received.lock(), b"ping over the loop");
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn connect_refused_closes_with_typed_reason() {
        let reason_kind = Arc::new(parking_lot::Mutex::new(None::<String>));

        struct Expect {
            reason_kind: Arc<parking_lot::Mutex<Option<String>>>,
        }

        impl ConnectionHandler for Expect {
            fn on_close(&mut self, ctx: &mut ConnectionCtx<'_>, reason: Option<&ConnectionError>) {
                *self.reason_kind.lock() = reason.map(|e| e.to_string());
                ctx.reactor().stop();
            }
        }

        // Reserve a port and close the listener so nothing is accepting.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut reactor = Reactor::new().unwrap();
        let seen = reason_kind.clone();
        reactor
            .run_with(move |r| {
                watchdog(r);
                let conn = Connection::connect_tcp(
                    "127.0.0.1",
                    port,
                    Box::new(Expect {
                        reason_kind: seen.clone(),
                    }),
                )
                .expect("connect starts");
                r.attach(conn).expect("attach");
                Ok(())
            })
            .unwrap();

        let reason = reason_kind.lock().clone().expect("close reason set");
        assert!(
            reason.contains("refused") || reason.contains("reset"),
            "unexpected reason: {reason}"
        );
    }
}
