//! One-shot response futures resolved by the I/O pump
//!
//! A promise settles at most once; later settle attempts are no-ops.
//! Continuations never run inside the resolver: they are queued and fired by
//! the pump that observes the settlement, in registration order. Callbacks
//! registered after settlement fire on the next pump.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::protocol::ResponsePayload;

type ThenCallback = Box<dyn FnOnce(&ResponsePayload)>;
type CatchCallback = Box<dyn FnOnce(&str)>;

#[derive(Debug, Clone, PartialEq)]
enum PromiseState {
    Pending,
    Resolved(ResponsePayload),
    Rejected(String),
}

struct PromiseCell {
    state: PromiseState,
    then_callbacks: Vec<ThenCallback>,
    catch_callbacks: Vec<CatchCallback>,
}

/// Single-fire future for a correlated response.
#[derive(Clone)]
pub struct ResponsePromise {
    cell: Rc<RefCell<PromiseCell>>,
}

impl ResponsePromise {
    pub fn new() -> Self {
        Self {
            cell: Rc::new(RefCell::new(PromiseCell {
                state: PromiseState::Pending,
                then_callbacks: Vec::new(),
                catch_callbacks: Vec::new(),
            })),
        }
    }

    /// Settle with a response payload. No-op if already settled.
    pub fn resolve(&self, payload: ResponsePayload) {
        let mut cell = self.cell.borrow_mut();
        if cell.state != PromiseState::Pending {
            return;
        }
        cell.state = PromiseState::Resolved(payload);
    }

    /// Settle with a failure reason. No-op if already settled.
    pub fn reject(&self, reason: impl Into<String>) {
        let mut cell = self.cell.borrow_mut();
        if cell.state != PromiseState::Pending {
            return;
        }
        cell.state = PromiseState::Rejected(reason.into());
    }

    /// Register a continuation for the resolved payload.
    pub fn then(&self, callback: impl FnOnce(&ResponsePayload) + 'static) -> &Self {
        self.cell.borrow_mut().then_callbacks.push(Box::new(callback));
        self
    }

    /// Register a continuation for the rejection reason.
    pub fn catch(&self, callback: impl FnOnce(&str) + 'static) -> &Self {
        self.cell.borrow_mut().catch_callbacks.push(Box::new(callback));
        self
    }

    pub fn is_pending(&self) -> bool {
        self.cell.borrow().state == PromiseState::Pending
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// The resolved payload, if any.
    pub fn result(&self) -> Option<ResponsePayload> {
        match &self.cell.borrow().state {
            PromiseState::Resolved(payload) => Some(payload.clone()),
            _ => None,
        }
    }

    /// The rejection reason, if any.
    pub fn rejection(&self) -> Option<String> {
        match &self.cell.borrow().state {
            PromiseState::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Run queued continuations if the promise has settled. Callbacks may
    /// register further continuations on the same promise; those run too.
    pub fn fire(&self) {
        loop {
            enum Next {
                Then(ThenCallback, ResponsePayload),
                Catch(CatchCallback, String),
            }
            let next = {
                let mut cell = self.cell.borrow_mut();
                match cell.state.clone() {
                    PromiseState::Pending => return,
                    PromiseState::Resolved(payload) => {
                        cell.catch_callbacks.clear();
                        if cell.then_callbacks.is_empty() {
                            return;
                        }
                        Next::Then(cell.then_callbacks.remove(0), payload)
                    }
                    PromiseState::Rejected(reason) => {
                        cell.then_callbacks.clear();
                        if cell.catch_callbacks.is_empty() {
                            return;
                        }
                        Next::Catch(cell.catch_callbacks.remove(0), reason)
                    }
                }
            };
            match next {
                Next::Then(callback, payload) => callback(&payload),
                Next::Catch(callback, reason) => callback(&reason),
            }
        }
    }

    fn downgrade(&self) -> Weak<RefCell<PromiseCell>> {
        Rc::downgrade(&self.cell)
    }
}

impl Default for ResponsePromise {
    fn default() -> Self {
        Self::new()
    }
}

/// Settled promises whose continuations still need a pump. Entries are weak:
/// once nobody holds the promise any more it drops out of the set.
#[derive(Default)]
pub struct PromiseSet {
    tracked: Vec<Weak<RefCell<PromiseCell>>>,
}

impl PromiseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, promise: &ResponsePromise) {
        self.tracked.push(promise.downgrade());
    }

    /// Fire pending continuations on every live tracked promise.
    pub fn pump(&mut self) {
        self.tracked.retain(|weak| match weak.upgrade() {
            Some(cell) => {
                ResponsePromise { cell }.fire();
                true
            }
            None => false,
        });
    }
}
