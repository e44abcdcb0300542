//! Subscription plumbing shared by every protocol layer.
//!
//! A layer owns a [`FrameHooks`] list its subprotocols register into: an
//! inbound frame is offered to each hook in registration order and the
//! first hook returning `true` consumes it. Decoded data flows upward
//! through a [`Callbacks`] list. Both lists tolerate re-entrant
//! registration (a callback may register further callbacks); the frames
//! themselves never re-enter a layer mid-dispatch because the adapter
//! queues looped-back emissions and drains them run-to-completion.

use std::cell::RefCell;

/// An ordered list of frame-inspection hooks; first `true` wins.
pub struct FrameHooks<F> {
    hooks: RefCell<Vec<Box<dyn FnMut(&F) -> bool>>>,
}

impl<F> FrameHooks<F> {
    pub fn new() -> Self {
        FrameHooks {
            hooks: RefCell::new(Vec::new()),
        }
    }

    pub fn register(&self, hook: Box<dyn FnMut(&F) -> bool>) {
        self.hooks.borrow_mut().push(hook);
    }

    /// Offer `frame` to each hook in registration order. Returns whether
    /// any hook consumed it.
    pub fn offer(&self, frame: &F) -> bool {
        let mut hooks = self.hooks.take();
        let mut consumed = false;
        for hook in hooks.iter_mut() {
            if hook(frame) {
                consumed = true;
                break;
            }
        }
        // Hooks registered while dispatching landed in the (empty) cell;
        // keep registration order stable across the swap.
        let mut cell = self.hooks.borrow_mut();
        let added = std::mem::take(&mut *cell);
        *cell = hooks;
        cell.extend(added);
        consumed
    }

    pub fn clear(&self) {
        self.hooks.borrow_mut().clear();
    }
}

impl<F> Default for FrameHooks<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Push-style subscribers for a layer's decoded data.
pub struct Callbacks<A: ?Sized> {
    subs: RefCell<Vec<Box<dyn FnMut(&A)>>>,
}

impl<A: ?Sized> Callbacks<A> {
    pub fn new() -> Self {
        Callbacks {
            subs: RefCell::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, cb: Box<dyn FnMut(&A)>) {
        self.subs.borrow_mut().push(cb);
    }

    pub fn is_empty(&self) -> bool {
        self.subs.borrow().is_empty()
    }

    /// Deliver `data` to every subscriber.
    pub fn emit(&self, data: &A) {
        let mut subs = self.subs.take();
        for cb in subs.iter_mut() {
            cb(data);
        }
        let mut cell = self.subs.borrow_mut();
        let added = std::mem::take(&mut *cell);
        *cell = subs;
        cell.extend(added);
    }

    pub fn clear(&self) {
        self.subs.borrow_mut().clear();
    }
}

impl<A: ?Sized> Default for Callbacks<A> {
    fn default() -> Self {
        Self::new()
    }
}
