//! # Handler Registry
//!
//! The single source of truth for "is this chaincode running". Maps canonical
//! names to the handler of the connected unit, and tracks launches that are
//! still waiting for their unit to connect back.
//!
//! ## Invariants
//!
//! - At most one handler per canonical name. `register` is atomic with
//!   respect to concurrent registrations of the same name.
//! - At most one launch state per canonical name. Everyone launching the same
//!   name observes that one state and therefore the same outcome.
//! - A failed launch leaves neither a launch state nor a handler behind.
//! - A closing connection only ever removes its own handler.
//!
//! Uses DashMap so lookups of unrelated names never contend.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::error::LaunchError;
use crate::error::RegistryError;
use crate::handler::Handler;

type Outcome = Option<Result<(), LaunchError>>;

/// Single-shot outcome cell of one launch: pending, then ready or failed.
#[derive(Clone)]
pub struct LaunchState {
    name: Arc<str>,
    tx: Arc<watch::Sender<Outcome>>,
}

impl LaunchState {
    fn new(name: &str) -> Self {
        let (tx, _) = watch::channel(None);
        Self { name: Arc::from(name), tx: Arc::new(tx) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves the launch. Only the first notification counts.
    pub fn notify(&self, outcome: Result<(), LaunchError>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// The outcome, if already resolved.
    pub fn outcome(&self) -> Outcome {
        self.tx.borrow().clone()
    }

    /// Waits until the launch is resolved.
    pub async fn wait(&self) -> Result<(), LaunchError> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
            Err(_) => Err(LaunchError::Deregistered(self.name.to_string())),
        }
    }

    fn same(&self, other: &LaunchState) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl std::fmt::Debug for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchState")
            .field("name", &self.name)
            .field("outcome", &self.outcome())
            .finish()
    }
}

pub struct HandlerRegistry {
    allow_unsolicited_registration: bool,
    handlers: DashMap<String, Arc<dyn Handler>>,
    launching: DashMap<String, LaunchState>,
}

impl HandlerRegistry {
    /// `allow_unsolicited_registration` admits units nobody launched
    /// (developer mode, where the user runs the chaincode by hand).
    pub fn new(allow_unsolicited_registration: bool) -> Self {
        Self {
            allow_unsolicited_registration,
            handlers: DashMap::new(),
            launching: DashMap::new(),
        }
    }

    /// Returns the launch state for `cname`, creating it if needed. The flag
    /// is true when the state already existed, i.e. someone else is (or was)
    /// responsible for starting the unit.
    pub fn launching(&self, cname: &str) -> (LaunchState, bool) {
        match self.launching.entry(cname.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                let state = LaunchState::new(cname);
                entry.insert(state.clone());
                tracing::debug!(chaincode = cname, "launch state created");
                (state, false)
            }
        }
    }

    /// Marks the launch of `cname` as ready.
    pub fn ready(&self, cname: &str) {
        let state = self.launching.get(cname).map(|s| s.value().clone());
        if let Some(state) = state {
            state.notify(Ok(()));
            tracing::debug!(chaincode = cname, "launch ready");
        }
    }

    /// Fails `state`, first removing it and any handler registered under
    /// `cname` so that the woken waiters can retry from scratch. A newer
    /// launch state for the same name is left alone.
    pub fn failed(&self, cname: &str, state: &LaunchState, err: LaunchError) {
        let removed = self.launching.remove_if(cname, |_, current| current.same(state)).is_some();
        if removed {
            self.handlers.remove(cname);
        }
        tracing::debug!(chaincode = cname, error = %err, "launch failed");
        state.notify(Err(err));
    }

    pub fn handler(&self, cname: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(cname).map(|h| h.value().clone())
    }

    pub fn is_registered(&self, cname: &str) -> bool {
        self.handlers.contains_key(cname)
    }

    /// Registers a connected unit under its canonical name.
    pub fn register(&self, handler: Arc<dyn Handler>) -> Result<(), RegistryError> {
        let cname = handler.chaincode_name().to_string();
        match self.handlers.entry(cname.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(chaincode = %cname, "duplicate registration");
                Err(RegistryError::Duplicate(cname))
            }
            Entry::Vacant(entry) => {
                if !self.allow_unsolicited_registration && !self.launching.contains_key(&cname) {
                    return Err(RegistryError::Unsolicited(cname));
                }
                entry.insert(handler);
                tracing::debug!(chaincode = %cname, "handler registered");
                Ok(())
            }
        }
    }

    /// Removes whatever is registered or launching under `cname`. Idempotent.
    pub fn deregister(&self, cname: &str) {
        self.handlers.remove(cname);
        if let Some((_, state)) = self.launching.remove(cname) {
            state.notify(Err(LaunchError::Deregistered(cname.to_string())));
        }
        tracing::debug!(chaincode = cname, "deregistered");
    }

    /// Removes `handler` if it is still the one registered under `cname`.
    pub fn deregister_handler(&self, cname: &str, handler: &Arc<dyn Handler>) -> bool {
        let removed = self
            .handlers
            .remove_if(cname, |_, current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(handler)))
            .is_some();
        if removed {
            if let Some((_, state)) = self.launching.remove(cname) {
                state.notify(Err(LaunchError::Deregistered(cname.to_string())));
            }
            tracing::debug!(chaincode = cname, "handler deregistered");
        }
        removed
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}
