//! Bounded-concurrency iteration scheduled entirely through the reactor.
//!
//! An [`Iter`] snapshots its input at construction and drives up to
//! `concurrency` in-flight items at a time. Each item's callback receives a
//! continuation ([`Next`] for `each`, [`Emit`] for `map`/`inject`) that it
//! must invoke exactly once to advance the iteration — the continuation
//! consumes itself, so invoking it twice is a compile error rather than a
//! runtime fault, and `each`'s advance-only [`Next`] cannot be confused with
//! the value-carrying [`Emit`]. Driving an `Iter` consumes it: re-iteration
//! is impossible by construction.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::ReactorError;
use crate::reactor::Reactor;

/// Value-carrying continuation for `map` and `inject`. Must be resolved
/// exactly once; consuming `self` enforces it.
pub struct Emit<V> {
    resolve: Box<dyn FnOnce(&mut Reactor, V)>,
}

impl<V> Emit<V> {
    /// Deliver this item's result and let the iteration advance.
    pub fn resolve(self, reactor: &mut Reactor, value: V) {
        (self.resolve)(reactor, value)
    }
}

/// Advance-only continuation for `each`.
pub struct Next(Emit<()>);

impl Next {
    /// Mark this item done and let the iteration advance.
    pub fn proceed(self, reactor: &mut Reactor) {
        self.0.resolve(reactor, ())
    }
}

/// Live control over a running iteration.
#[derive(Clone)]
pub struct IterHandle {
    concurrency: Rc<Cell<usize>>,
    pump: Rc<dyn Fn(&mut Reactor)>,
}

impl IterHandle {
    pub fn concurrency(&self) -> usize {
        self.concurrency.get()
    }

    /// Adjust the concurrency bound mid-run. Raising it spawns additional
    /// workers on the next tick (deferral keeps this safe to call from
    /// inside a visit callback); lowering it takes effect as in-flight
    /// items complete.
    pub fn set_concurrency(&self, reactor: &mut Reactor, concurrency: usize) {
        self.concurrency.set(concurrency.max(1));
        let pump = Rc::clone(&self.pump);
        let _ = reactor.next_tick(move |reactor| pump(reactor));
    }
}

struct DriveState<T, V> {
    /// Remaining items, tagged with their original position.
    items: VecDeque<(usize, T)>,
    /// Slot per input item, filled as continuations resolve.
    results: Vec<Option<V>>,
    in_flight: usize,
    ended: bool,
}

/// A one-shot snapshot of items plus a concurrency bound.
pub struct Iter<T> {
    items: Vec<T>,
    concurrency: usize,
}

impl<T: 'static> Iter<T> {
    pub fn new(items: impl IntoIterator<Item = T>, concurrency: usize) -> Self {
        Self {
            items: items.into_iter().collect(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Visit every item with bounded concurrency; `after` runs once the
    /// list is exhausted and every in-flight continuation has resolved.
    pub fn each<F, A>(self, reactor: &mut Reactor, foreach: F, after: A) -> Result<IterHandle, ReactorError>
    where
        F: FnMut(&mut Reactor, T, Next) + 'static,
        A: FnOnce(&mut Reactor) + 'static,
    {
        let mut foreach = foreach;
        self.drive(
            reactor,
            move |reactor, item, emit| foreach(reactor, item, Next(emit)),
            move |reactor, _results: Vec<()>| after(reactor),
        )
    }

    /// Collect one result per item, in input order, regardless of the order
    /// continuations resolve in.
    pub fn map<V, F, A>(self, reactor: &mut Reactor, foreach: F, after: A) -> Result<IterHandle, ReactorError>
    where
        V: 'static,
        F: FnMut(&mut Reactor, T, Emit<V>) + 'static,
        A: FnOnce(&mut Reactor, Vec<V>) + 'static,
    {
        self.drive(reactor, foreach, after)
    }

    /// Fold the items through an accumulator. The accumulator is handed to
    /// one item at a time and travels through each continuation, so the
    /// walk is sequential by construction: whoever holds the accumulator
    /// owns it until their continuation resolves.
    pub fn inject<Acc, F, A>(
        self,
        reactor: &mut Reactor,
        initial: Acc,
        foreach: F,
        after: A,
    ) -> Result<(), ReactorError>
    where
        Acc: 'static,
        F: FnMut(&mut Reactor, Acc, T, Emit<Acc>) + 'static,
        A: FnOnce(&mut Reactor, Acc) + 'static,
    {
        let items: Rc<RefCell<VecDeque<T>>> = Rc::new(RefCell::new(self.items.into()));
        let foreach = Rc::new(RefCell::new(foreach));
        let after = Rc::new(RefCell::new(Some(after)));

        fn step<T: 'static, Acc: 'static, F, A>(
            items: &Rc<RefCell<VecDeque<T>>>,
            foreach: &Rc<RefCell<F>>,
            after: &Rc<RefCell<Option<A>>>,
            reactor: &mut Reactor,
            acc: Acc,
        ) where
            F: FnMut(&mut Reactor, Acc, T, Emit<Acc>) + 'static,
            A: FnOnce(&mut Reactor, Acc) + 'static,
        {
            let item = items.borrow_mut().pop_front();
            match item {
                None => {
                    if let Some(after) = after.borrow_mut().take() {
                        after(reactor, acc);
                    }
                }
                Some(item) => {
                    let emit = {
                        let items = Rc::clone(items);
                        let foreach_rc = Rc::clone(foreach);
                        let after = Rc::clone(after);
                        Emit {
                            resolve: Box::new(move |reactor, acc| {
                                let _ = reactor.next_tick(move |reactor| {
                                    step(&items, &foreach_rc, &after, reactor, acc)
                                });
                            }),
                        }
                    };
                    (foreach.borrow_mut())(reactor, acc, item, emit);
                }
            }
        }

        let items_rc = Rc::clone(&items);
        let foreach_rc = Rc::clone(&foreach);
        let after_rc = Rc::clone(&after);
        reactor.next_tick(move |reactor| step(&items_rc, &foreach_rc, &after_rc, reactor, initial))?;
        Ok(())
    }

    fn drive<V, F, A>(self, reactor: &mut Reactor, foreach: F, after: A) -> Result<IterHandle, ReactorError>
    where
        V: 'static,
        F: FnMut(&mut Reactor, T, Emit<V>) + 'static,
        A: FnOnce(&mut Reactor, Vec<V>) + 'static,
    {
        let total = self.items.len();
        let state = Rc::new(RefCell::new(DriveState {
            items: self.items.into_iter().enumerate().collect(),
            results: (0..total).map(|_| None).collect(),
            in_flight: 0,
            ended: false,
        }));
        let concurrency = Rc::new(Cell::new(self.concurrency));
        let foreach = Rc::new(RefCell::new(foreach));
        let after = Rc::new(RefCell::new(Some(after)));

        fn pump<T: 'static, V: 'static, F, A>(
            state: &Rc<RefCell<DriveState<T, V>>>,
            concurrency: &Rc<Cell<usize>>,
            foreach: &Rc<RefCell<F>>,
            after: &Rc<RefCell<Option<A>>>,
            reactor: &mut Reactor,
        ) where
            F: FnMut(&mut Reactor, T, Emit<V>) + 'static,
            A: FnOnce(&mut Reactor, Vec<V>) + 'static,
        {
            loop {
                let (index, item) = {
                    let mut s = state.borrow_mut();
                    if s.ended || s.in_flight >= concurrency.get() {
                        return;
                    }
                    match s.items.pop_front() {
                        Some(next) => {
                            s.in_flight += 1;
                            next
                        }
                        None => {
                            if s.in_flight > 0 {
                                return;
                            }
                            s.ended = true;
                            let results =
                                s.results.drain(..).map(|v| v.expect("resolved")).collect();
                            drop(s);
                            if let Some(after) = after.borrow_mut().take() {
                                after(reactor, results);
                            }
                            return;
                        }
                    }
                };
                let emit = {
                    let state = Rc::clone(state);
                    let concurrency = Rc::clone(concurrency);
                    let foreach = Rc::clone(foreach);
                    let after = Rc::clone(after);
                    Emit {
                        resolve: Box::new(move |reactor, value| {
                            {
                                let mut s = state.borrow_mut();
                                s.results[index] = Some(value);
                                s.in_flight -= 1;
                            }
                            // Advance on a later tick: workers run through
                            // the reactor, never recursively.
                            let _ = reactor.next_tick(move |reactor| {
                                pump(&state, &concurrency, &foreach, &after, reactor)
                            });
                        }),
                    }
                };
                (foreach.borrow_mut())(reactor, item, emit);
            }
        }

        let handle = IterHandle {
            concurrency: Rc::clone(&concurrency),
            pump: {
                let state = Rc::clone(&state);
                let concurrency = Rc::clone(&concurrency);
                let foreach = Rc::clone(&foreach);
                let after = Rc::clone(&after);
                Rc::new(move |reactor: &mut Reactor| {
                    pump(&state, &concurrency, &foreach, &after, reactor)
                })
            },
        };

        let pump_once = Rc::clone(&handle.pump);
        reactor.next_tick(move |reactor| pump_once(reactor))?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn each_respects_the_concurrency_bound() {
        let in_flight = Rc::new(Cell::new(0usize));
        let peak = Rc::new(Cell::new(0usize));
        let visited = Rc::new(Cell::new(0usize));

        let (in_flight2, peak2, visited2) = (in_flight.clone(), peak.clone(), visited.clone());
        run_reactor(move |r| {
            let iter = Iter::new(vec![1, 2, 3, 4, 5], 2);
            iter.each(
                r,
                move |r, _item, next| {
                    in_flight2.set(in_flight2.get() + 1);
                    peak2.set(peak2.get().max(in_flight2.get()));
                    visited2.set(visited2.get() + 1);
                    let in_flight3 = in_flight2.clone();
                    // Hold the slot for one tick before advancing.
                    r.next_tick(move |r| {
                        in_flight3.set(in_flight3.get() - 1);
                        next.proceed(r);
                    })
                    .unwrap();
                },
                |r| r.stop(),
            )?;
            Ok(())
        });

        assert_eq!(visited.get(), 5);
        assert_eq!(peak.get(), 2, "more workers than the bound ran at once");
    }

    #[test]
    fn each_with_tick_delay_runs_in_rounds() {
        // Four items at concurrency 2, each worker waiting one tick before
        // advancing: items must start in two batches, not four.
        let starts: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));

        let starts2 = starts.clone();
        run_reactor(move |r| {
            let iter = Iter::new(vec![1, 2, 3, 4], 2);
            iter.each(
                r,
                move |r, _item, next| {
                    starts2.borrow_mut().push(r.ticks());
                    r.next_tick(move |r| next.proceed(r)).unwrap();
                },
                |r| r.stop(),
            )?;
            Ok(())
        });

        let starts = starts.borrow();
        assert_eq!(starts.len(), 4);
        assert_eq!(starts[0], starts[1], "first batch starts together");
        assert_eq!(starts[2], starts[3], "second batch starts together");
        assert!(starts[2] > starts[0], "second batch waits for the first");
    }

    #[test]
    fn map_preserves_input_order() {
        let result: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));

        let result2 = result.clone();
        run_reactor(move |r| {
            let iter = Iter::new(vec![1, 2, 3, 4], 3);
            iter.map(
                r,
                |r, item, emit| {
                    // Odd items resolve a tick later than even ones.
                    if item % 2 == 1 {
                        r.next_tick(move |r| emit.resolve(r, item * 10)).unwrap();
                    } else {
                        emit.resolve(r, item * 10);
                    }
                },
                move |r, values| {
                    *result2.borrow_mut() = values;
                    r.stop();
                },
            )?;
            Ok(())
        });

        assert_eq!(*result.borrow(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn inject_folds_in_order() {
        let result = Rc::new(Cell::new(0i64));

        let result2 = result.clone();
        run_reactor(move |r| {
            let iter = Iter::new(vec![1i64, 2, 3, 4], 2);
            iter.inject(
                r,
                100i64,
                |r, acc, item, emit| emit.resolve(r, acc + item),
                move |r, acc| {
                    result2.set(acc);
                    r.stop();
                },
            )?;
            Ok(())
        });

        assert_eq!(result.get(), 110);
    }

    #[test]
    fn raising_concurrency_mid_run_spawns_workers() {
        let peak = Rc::new(Cell::new(0usize));
        let in_flight = Rc::new(Cell::new(0usize));

        let (peak2, in_flight2) = (peak.clone(), in_flight.clone());
        run_reactor(move |r| {
            let iter = Iter::new(vec![1, 2, 3, 4, 5, 6], 1);
            let handle_slot: Rc<RefCell<Option<IterHandle>>> = Rc::new(RefCell::new(None));
            let handle_ref = handle_slot.clone();
            let handle = iter.each(
                r,
                move |r, item, next| {
                    in_flight2.set(in_flight2.get() + 1);
                    peak2.set(peak2.get().max(in_flight2.get()));
                    if item == 1 {
                        // Widen the pipe once the first item is in flight.
                        if let Some(handle) = handle_ref.borrow().as_ref() {
                            handle.set_concurrency(r, 3);
                        }
                    }
                    let in_flight3 = in_flight2.clone();
                    r.next_tick(move |r| {
                        in_flight3.set(in_flight3.get() - 1);
                        next.proceed(r);
                    })
                    .unwrap();
                },
                |r| r.stop(),
            )?;
            *handle_slot.borrow_mut() = Some(handle);
            Ok(())
        });

        assert!(peak.get() >= 2, "raised bound never took effect");
        assert!(peak.get() <= 3, "bound overshot: {}", peak.get());
    }

    #[test]
    fn empty_iteration_still_completes() {
        let done = Rc::new(Cell::new(false));
        let done2 = done.clone();
        run_reactor(move |r| {
            Iter::new(Vec::<i32>::new(), 4).each(
                r,
                |_r, _item, _next| panic!("no items to visit"),
                move |r| {
                    done2.set(true);
                    r.stop();
                },
            )?;
            Ok(())
        });
        assert!(done.get());
    }
}
