//! Thread-safe producer/consumer queue marshalled onto the reactor thread.
//!
//! `push` and `pop` may be called from any thread; both are scheduled
//! through the reactor's [`Handle`], so the buffered items and the waiter
//! list are only ever touched by reactor-scheduled closures. A `pop` with no
//! buffered item parks its callback until a future `push` pairs the oldest
//! waiter with the new item.
//!
//! The `*_direct` variants take `&mut Reactor` as proof the caller is
//! already on the reactor thread and skip the scheduling hop.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::reactor::{Handle, Reactor};

type Waiter<T> = Box<dyn FnOnce(&mut Reactor, T) + Send + 'static>;

struct QueueState<T> {
    items: VecDeque<T>,
    waiters: VecDeque<Waiter<T>>,
}

/// A queue whose operations run on the reactor thread regardless of the
/// calling thread.
pub struct CrossQueue<T> {
    handle: Handle,
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for CrossQueue<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> CrossQueue<T> {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            state: Arc::new(Mutex::new(QueueState {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Append an item, delivering it immediately to the oldest waiter if
    /// one is parked. Safe from any thread.
    pub fn push(&self, item: T) {
        let state = self.state.clone();
        self.handle
            .schedule(move |reactor| Self::push_state(&state, reactor, item));
    }

    /// Pop an item into `f`: immediately when one is buffered, otherwise
    /// when a future `push` provides one. Safe from any thread.
    pub fn pop<F>(&self, f: F)
    where
        F: FnOnce(&mut Reactor, T) + Send + 'static,
    {
        let state = self.state.clone();
        self.handle
            .schedule(move |reactor| Self::pop_state(&state, reactor, Box::new(f)));
    }

    /// Reactor-thread `push` without the scheduling hop.
    pub fn push_direct(&self, reactor: &mut Reactor, item: T) {
        Self::push_state(&self.state, reactor, item);
    }

    /// Reactor-thread `pop` without the scheduling hop.
    pub fn pop_direct<F>(&self, reactor: &mut Reactor, f: F)
    where
        F: FnOnce(&mut Reactor, T) + Send + 'static,
    {
        Self::pop_state(&self.state, reactor, Box::new(f));
    }

    /// Take a buffered item if one exists, without waiting.
    pub fn try_pop(&self, _reactor: &mut Reactor) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    pub fn has_waiters(&self, _reactor: &mut Reactor) -> bool {
        !self.state.lock().waiters.is_empty()
    }

    pub fn buffered(&self, _reactor: &mut Reactor) -> usize {
        self.state.lock().items.len()
    }

    fn push_state(state: &Arc<Mutex<QueueState<T>>>, reactor: &mut Reactor, item: T) {
        let waiter = {
            let mut s = state.lock();
            match s.waiters.pop_front() {
                Some(waiter) => Some((waiter, item)),
                None => {
                    s.items.push_back(item);
                    None
                }
            }
        };
        // The waiter runs outside the lock: it may push or pop again.
        if let Some((waiter, item)) = waiter {
            waiter(reactor, item);
        }
    }

    fn pop_state(state: &Arc<Mutex<QueueState<T>>>, reactor: &mut Reactor, f: Waiter<T>) {
        let item = {
            let mut s = state.lock();
            match s.items.pop_front() {
                Some(item) => item,
                None => {
                    s.waiters.push_back(f);
                    return;
                }
            }
        };
        // Delivery runs outside the lock: the callback may push or pop.
        f(reactor, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReactorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn run_reactor(init: impl FnOnce(&mut Reactor) -> Result<(), ReactorError>) {
        let mut reactor = Reactor::new().unwrap();
        reactor
            .run_with(|r| {
                r.delay(Duration::from_secs(5), |r| {
                    r.stop();
                    panic!("watchdog fired");
                })?;
                init(r)
            })
            .unwrap();
    }

    #[test]
    fn buffered_item_delivers_immediately() {
        let got = Arc::new(AtomicUsize::new(0));
        let got2 = got.clone();
        run_reactor(move |r| {
            let queue: CrossQueue<usize> = CrossQueue::new(r.handle());
            queue.push_direct(r, 7);
            let got3 = got2.clone();
            queue.pop_direct(r, move |r, item| {
                got3.store(item, Ordering::SeqCst);
                r.stop();
            });
            Ok(())
        });
        assert_eq!(got.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn waiters_pair_with_pushes_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        run_reactor(move |r| {
            let queue: CrossQueue<&'static str> = CrossQueue::new(r.handle());
            let (a, b) = (order2.clone(), order2.clone());
            queue.pop_direct(r, move |_r, item| a.lock().push(("first", item)));
            queue.pop_direct(r, move |r, item| {
                b.lock().push(("second", item));
                r.stop();
            });
            queue.push_direct(r, "x");
            queue.push_direct(r, "y");
            Ok(())
        });
        assert_eq!(*order.lock(), vec![("first", "x"), ("second", "y")]);
    }

    #[test]
    fn push_from_foreign_thread_reaches_a_waiter() {
        let got = Arc::new(AtomicUsize::new(0));
        let got2 = got.clone();
        run_reactor(move |r| {
            let queue: CrossQueue<usize> = CrossQueue::new(r.handle());
            let got3 = got2.clone();
            queue.pop_direct(r, move |r, item| {
                got3.store(item, Ordering::SeqCst);
                r.stop();
            });
            let producer = queue.clone();
            std::thread::spawn(move || producer.push(41));
            Ok(())
        });
        assert_eq!(got.load(Ordering::SeqCst), 41);
    }
}
