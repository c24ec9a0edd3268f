use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use futures_util::stream;

use super::{Session, SessionState};
use crate::backend::Backend;
use crate::error::AttachError;
use crate::module::RetryPolicy;
use crate::process::{Candidates, ProcessFilter, ProcessHandle};

/// Entry point of the engine.
///
/// It attaches sessions to processes through a platform backend, and keeps
/// track of the attached processes so that the same process is never
/// attached twice.
pub struct Instrumenter<B> {
    backend: B,
    registry: Arc<Registry>,
}

impl<B: Backend> Instrumenter<B> {
    /// Creates an instrumenter over the given backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: Arc::default(),
        }
    }

    /// Returns the platform backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Enumerates the running processes matching the given filter.
    pub async fn find_candidates(
        &self,
        filter: impl Into<ProcessFilter>,
    ) -> crate::Result<Candidates> {
        crate::process::find_candidates(&self.backend, filter.into()).await
    }

    /// Attaches a session to the given process.
    ///
    /// Every error is recoverable: the caller is expected to move on to the
    /// next candidate.
    #[tracing::instrument(name = "Attach", skip_all, fields(pid = process.pid(), name = process.name()))]
    pub async fn attach(
        &self,
        process: &ProcessHandle,
    ) -> Result<Session<B::Target>, AttachError> {
        tracing::debug!(state = %SessionState::Created, "session created");

        let claim = self
            .registry
            .claim(process.pid())
            .ok_or(AttachError::AlreadyAttached { pid: process.pid() })?;

        tracing::debug!(state = %SessionState::Attaching, "attaching");

        match self.backend.attach(process).await {
            Ok(target) => {
                tracing::info!("attached");

                let id = self.registry.next_session.fetch_add(1, Ordering::Relaxed);
                Ok(Session::new(id, process.clone(), target, claim))
            }
            Err(e) => {
                let e = AttachError::from_fault(process.pid(), e);
                tracing::warn!(state = %SessionState::AttachFailed, "{e}");
                Err(e)
            }
        }
    }

    /// Finds a process which loaded the given module.
    ///
    /// Up to `parallelism` candidates are attached and polled concurrently.
    /// The first candidate whose module shows up wins, and every other
    /// session is detached. Returns `None` if no candidate qualified.
    #[tracing::instrument(name = "Discover", skip(self, filter, policy))]
    pub async fn discover(
        &self,
        filter: impl Into<ProcessFilter>,
        module: &str,
        policy: &RetryPolicy,
        parallelism: usize,
    ) -> crate::Result<Option<Session<B::Target>>> {
        let candidates = self.find_candidates(filter).await?.collect::<Vec<_>>();

        tracing::debug!(candidates = candidates.len(), "polling candidates");

        let mut pending = stream::iter(candidates)
            .map(|process| async move {
                let mut session = match self.attach(&process).await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::debug!(pid = process.pid(), "skipping candidate: {e}");
                        return None;
                    }
                };

                match session.await_module(module, policy).await {
                    Ok(_) => Some(session),
                    Err(e) => {
                        tracing::debug!(pid = process.pid(), "skipping candidate: {e}");
                        None
                    }
                }
            })
            .buffer_unordered(parallelism.max(1));

        while let Some(outcome) = pending.next().await {
            if let Some(session) = outcome {
                tracing::info!(pid = session.process().pid(), "target process found");
                return Ok(Some(session));
            }
        }

        Ok(None)
    }
}

/// Attached processes of an [Instrumenter].
#[derive(Debug, Default)]
pub(crate) struct Registry {
    attached: Mutex<HashSet<u64>>,
    next_session: AtomicU64,
}

impl Registry {
    /// Marks a process as attached, unless it already is.
    fn claim(self: &Arc<Self>, pid: u64) -> Option<Claim> {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid)
            .then(|| Claim {
                registry: self.clone(),
                pid,
            })
    }
}

/// Registry entry of an attached process, freed when dropped.
#[derive(Debug)]
pub(crate) struct Claim {
    registry: Arc<Registry>,
    pid: u64,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.pid);
    }
}
