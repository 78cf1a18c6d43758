//! Hot module replacement state.
//!
//! Each transpiled module carries a small state machine driven from two
//! sides: updates arriving through the module store mark it dirty, and the
//! module's own code registers intent at evaluation time
//! (`hot.accept` / `hot.decline` / `hot.dispose`). A dirty module that
//! declined forces a hard reload. The engine-wide status
//! (`idle → check → apply → idle`, `fail` on forced reload) is broadcast
//! to registered listeners.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Per-module HMR state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmrState {
    #[default]
    Idle,
    /// Source changed since last evaluation.
    Dirty,
    /// The module called `hot.accept(self)` and re-evaluates in place.
    Accepted,
    /// The module called `hot.decline`; a dirty declined module hard
    /// reloads.
    Declined,
    /// The module ran its dispose handlers and awaits re-evaluation.
    Disposed,
}

/// Per-module HMR configuration, mutated by ops from the evaluated code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HmrConfig {
    pub state: HmrState,
    /// `hot.accept()` with no arguments.
    #[serde(default)]
    pub accepts_self: bool,
    /// Hashes passed to `hot.accept(dep, handler)`.
    #[serde(default)]
    pub accepted_dependencies: FxHashSet<String>,
    /// `hot.decline` was called.
    #[serde(default)]
    pub declined: bool,
    /// At least one `hot.dispose(handler)` is registered on the JS side.
    #[serde(default)]
    pub has_dispose_handler: bool,
}

impl HmrConfig {
    /// An update arrived for this module.
    pub fn set_dirty(&mut self) {
        self.state = HmrState::Dirty;
    }

    /// The module's code accepted its own updates.
    pub fn accept_self(&mut self) {
        self.accepts_self = true;
        if self.state == HmrState::Idle {
            self.state = HmrState::Accepted;
        }
    }

    /// The module's code accepted updates of a dependency.
    pub fn accept_dependency(&mut self, dep_hash: impl Into<String>) {
        self.accepted_dependencies.insert(dep_hash.into());
    }

    pub fn decline(&mut self) {
        self.declined = true;
        self.state = HmrState::Declined;
    }

    pub fn register_dispose(&mut self) {
        self.has_dispose_handler = true;
    }

    /// Dispose handlers ran; the module awaits re-evaluation.
    pub fn mark_disposed(&mut self) {
        self.state = HmrState::Disposed;
    }

    /// Re-evaluation finished.
    pub fn settle(&mut self) {
        self.state = if self.declined {
            HmrState::Declined
        } else if self.accepts_self {
            HmrState::Accepted
        } else {
            HmrState::Idle
        };
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, HmrState::Dirty | HmrState::Disposed)
    }

    /// A dirty module that declined updates cannot be patched in place.
    #[must_use]
    pub fn requires_hard_reload(&self) -> bool {
        self.declined && self.is_dirty()
    }

    /// Whether a dirty cycle may re-evaluate this module in place.
    #[must_use]
    pub fn can_hot_swap(&self) -> bool {
        !self.declined
    }
}

/// Engine-wide HMR status, broadcast to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmrStatus {
    #[default]
    Idle,
    /// Transpilation of an update is in flight.
    Check,
    /// Dirty modules are re-evaluating.
    Apply,
    /// An update could not be applied; a hard reload is pending.
    Fail,
    /// Dispose handlers are running.
    Dispose,
}

type Listener = Box<dyn Fn(HmrStatus)>;

/// Current status plus registered listeners.
#[derive(Default)]
pub struct HmrStatusBroadcast {
    status: HmrStatus,
    listeners: Vec<(usize, Listener)>,
    next_id: usize,
}

impl HmrStatusBroadcast {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(&self) -> HmrStatus {
        self.status
    }

    /// Transition and notify. No-op when the status is unchanged.
    pub fn set(&mut self, status: HmrStatus) {
        if self.status == status {
            return;
        }
        tracing::debug!(from = ?self.status, to = ?status, "hmr status");
        self.status = status;
        for (_, listener) in &self.listeners {
            listener(status);
        }
    }

    /// Register a listener; returns a token for [`Self::remove_listener`].
    pub fn add_listener(&mut self, listener: Listener) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: usize) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

impl std::fmt::Debug for HmrStatusBroadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmrStatusBroadcast")
            .field("status", &self.status)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
