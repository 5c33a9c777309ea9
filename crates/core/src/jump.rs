//! Test isolation through a bounded stack of jump contexts.
//!
//! A protected call captures a frame and runs a closure. Raising an escape
//! anywhere below it transfers control straight back to the capture point:
//! intermediate frames are unwound by the runtime and the protected call
//! reports [`Outcome::Escaped`]. The stack is bound to one execution context;
//! the type is deliberately `!Sync`.

use crate::JumpError;
use serde::Serialize;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

pub const DEFAULT_CAPACITY: usize = 10;

/// How a protected call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum Outcome {
    /// The closure returned normally.
    Completed,
    /// An escape was raised inside the closure.
    Escaped,
    /// The closure panicked. Carries the panic message.
    Panicked(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// Unwind payload carrying the token of the frame it is addressed to.
struct Escape {
    token: u64,
}

#[derive(Debug)]
pub struct JumpStack {
    frames: RefCell<Vec<u64>>,
    capacity: usize,
    next_token: Cell<u64>,
}

impl Default for JumpStack {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl JumpStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: RefCell::new(Vec::with_capacity(capacity)),
            capacity,
            next_token: Cell::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of contexts currently captured.
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Drop every captured context.
    pub fn reset(&self) {
        self.frames.borrow_mut().clear();
    }

    /// Run `f` under a fresh jump context.
    ///
    /// The depth after this returns always equals the depth before it was
    /// called, whichever way `f` ended.
    ///
    /// # Errors
    ///
    /// Returns [`JumpError::Exhausted`] without running `f` when every slot
    /// is already in use.
    pub fn run_protected<F: FnOnce()>(&self, f: F) -> Result<Outcome, JumpError> {
        let depth = self.depth();
        if depth >= self.capacity {
            tracing::warn!(depth, capacity = self.capacity, "jump context stack exhausted");
            return Err(JumpError::Exhausted {
                depth,
                capacity: self.capacity,
            });
        }

        let token = self.next_token.get();
        self.next_token.set(token.wrapping_add(1));
        self.frames.borrow_mut().push(token);
        tracing::debug!(depth = depth + 1, token, "captured jump context");

        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => {
                if !self.pop_if_top(token) {
                    tracing::warn!(
                        token,
                        "protected call returned after its jump context was restored"
                    );
                }
                Ok(Outcome::Completed)
            }
            Err(payload) => match payload.downcast::<Escape>() {
                Ok(escape) if escape.token == token => {
                    tracing::debug!(depth, token, "protected call escaped");
                    Ok(Outcome::Escaped)
                }
                Ok(escape) => {
                    // Our frame was restored earlier; the escape belongs further out.
                    self.truncate(depth);
                    panic::resume_unwind(escape)
                }
                Err(payload) => {
                    self.truncate(depth);
                    let message = panic_message(payload.as_ref());
                    tracing::debug!(depth, token, %message, "protected call panicked");
                    Ok(Outcome::Panicked(message))
                }
            },
        }
    }

    /// Abort the innermost protected call.
    ///
    /// Raising an escape with no captured context is a contract violation:
    /// the process aborts with a diagnostic on stderr. No protected call can
    /// intercept it.
    pub fn raise_escape(&self) -> ! {
        let popped = self.frames.borrow_mut().pop();
        let Some(token) = popped else {
            contract_violation(&JumpError::NoActiveContext)
        };
        tracing::debug!(depth = self.depth(), token, "raising escape");
        panic::resume_unwind(Box::new(Escape { token }))
    }

    /// Discard the innermost context without jumping to it.
    ///
    /// An escape raised afterwards lands at the next outer protected call.
    ///
    /// # Errors
    ///
    /// Returns [`JumpError::NoActiveContext`] when nothing is captured.
    pub fn restore_context(&self) -> Result<(), JumpError> {
        let token = self
            .frames
            .borrow_mut()
            .pop()
            .ok_or(JumpError::NoActiveContext)?;
        tracing::debug!(depth = self.depth(), token, "restored jump context");
        Ok(())
    }

    fn pop_if_top(&self, token: u64) -> bool {
        let mut frames = self.frames.borrow_mut();
        if frames.last() == Some(&token) {
            frames.pop();
            true
        } else {
            false
        }
    }

    fn truncate(&self, depth: usize) {
        self.frames.borrow_mut().truncate(depth);
    }
}

/// Report `err` and abort. Unwinding is skipped so no catch point sees it.
pub(crate) fn contract_violation(err: &JumpError) -> ! {
    tracing::error!(error = %err, "jump context contract violated");
    eprintln!("labwired-utest: fatal: {err}");
    std::process::abort()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
