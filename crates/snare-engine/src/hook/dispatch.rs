use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use super::{HookDescriptor, Invocation, OnEnter};
use crate::address::ResolvedAddress;
use crate::backend::{CallFrame, Interceptor};
use crate::channel::{Message, Sender};

/// Interception gate of a session.
///
/// Callbacks run while holding a read guard. Closing the gate takes the
/// write guard, so it waits for in-flight callbacks, and no callback starts
/// afterwards.
#[derive(Debug)]
pub(crate) struct Gate {
    open: RwLock<bool>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(true),
        }
    }

    /// Returns a guard if the gate is open.
    pub fn enter(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let guard = self.open.read().unwrap_or_else(PoisonError::into_inner);
        (*guard).then_some(guard)
    }

    /// Closes the gate, returning `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut open = self.open.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *open, false)
    }
}

/// Interceptor handed to the backend for one installed hook.
pub(crate) struct HookDispatch {
    pub descriptor: Arc<HookDescriptor>,
    pub address: ResolvedAddress,
    pub hits: Arc<AtomicU64>,
    pub gate: Arc<Gate>,
    pub on_enter: Arc<OnEnter>,
    pub notifier: Option<Sender<Message>>,
}

impl HookDispatch {
    fn report(&self, text: String) {
        tracing::warn!(hook = %self.descriptor.label(), "{text}");

        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(Message::Error { text });
        }
    }
}

impl Interceptor for HookDispatch {
    fn on_enter(&self, frame: &mut dyn CallFrame) {
        let Some(_open) = self.gate.enter() else {
            return;
        };

        self.hits.fetch_add(1, Ordering::Relaxed);

        let mut invocation = match Invocation::capture(
            self.descriptor.clone(),
            self.address,
            frame,
            self.notifier.as_ref(),
        ) {
            Ok(invocation) => invocation,
            Err(e) => {
                self.report(format!(
                    "failed to capture arguments of {}: {e}",
                    self.descriptor.label()
                ));
                return;
            }
        };

        (self.on_enter)(&mut invocation);

        if let Err(e) = invocation.commit() {
            self.report(format!(
                "failed to write back arguments of {}: {e}",
                self.descriptor.label()
            ));
        }
    }
}
