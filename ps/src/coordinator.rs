//! Cluster membership and lifecycle of a ps server.
//!
//! The state machine is `Forming -> Active -> Draining -> Closed`, elastic clusters may go
//! `Active -> Resharding -> Active` when a new rank joins.
//!
//! The scheduler ps collects the registration of every worker and publishes a versioned view of
//! the cluster. Every ps tracks its in-flight pull and push requests, so draining can wait for them.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use crossbeam_utils::CachePadded;
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use grpc::embedding::{MembershipStateType, WorkerViewOption};
use util::{error_bail, EmbeddingError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipState {
    Forming,
    Active,
    Resharding,
    Draining,
    Closed,
}

impl MembershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forming => "Forming",
            Self::Active => "Active",
            Self::Resharding => "Resharding",
            Self::Draining => "Draining",
            Self::Closed => "Closed",
        }
    }

    /// Whether pull and push requests are accepted.
    #[inline]
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Forming | Self::Active | Self::Resharding)
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<MembershipState> for MembershipStateType {
    fn from(state: MembershipState) -> Self {
        match state {
            MembershipState::Forming => Self::StateForming,
            MembershipState::Active => Self::StateActive,
            MembershipState::Resharding => Self::StateResharding,
            MembershipState::Draining => Self::StateDraining,
            MembershipState::Closed => Self::StateClosed,
        }
    }
}

impl From<MembershipStateType> for MembershipState {
    fn from(state: MembershipStateType) -> Self {
        match state {
            MembershipStateType::StateForming => Self::Forming,
            MembershipStateType::StateActive => Self::Active,
            MembershipStateType::StateResharding => Self::Resharding,
            MembershipStateType::StateDraining => Self::Draining,
            MembershipStateType::StateClosed => Self::Closed,
        }
    }
}

/// Versioned view of the cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerView {
    /// Increased on every membership change.
    pub version: u64,

    pub state: MembershipState,

    pub expected_workers: u32,

    /// Rank to endpoint.
    pub endpoints: BTreeMap<u32, String>,
}

impl WorkerView {
    pub fn new(expected_workers: u32) -> Self {
        Self {
            version: 0,
            state: MembershipState::Forming,
            expected_workers,
            endpoints: BTreeMap::new(),
        }
    }

    /// Endpoints ordered by rank, which is also the shard index.
    pub fn ordered_endpoints(&self) -> Vec<String> {
        self.endpoints.values().cloned().collect()
    }

    pub fn to_option(&self) -> WorkerViewOption {
        WorkerViewOption {
            version: self.version,
            state: MembershipStateType::from(self.state).into(),
            expected_workers: self.expected_workers,
            endpoints: self
                .endpoints
                .iter()
                .map(|(rank, endpoint)| (*rank, endpoint.clone()))
                .collect(),
        }
    }

    pub fn from_option(option: &WorkerViewOption) -> Self {
        Self {
            version: option.version,
            state: MembershipState::from(option.state()),
            expected_workers: option.expected_workers,
            endpoints: option
                .endpoints
                .iter()
                .map(|(rank, endpoint)| (*rank, endpoint.clone()))
                .collect(),
        }
    }
}

pub struct Coordinator {
    elastic: bool,

    view: Mutex<WorkerView>,

    /// Pull and push requests being handled. Increased only while holding `view`.
    in_flight: CachePadded<AtomicUsize>,

    /// Notified when the state becomes `Closed`.
    closed: Notify,
}

impl Coordinator {
    pub fn new(expected_workers: u32, elastic: bool) -> Self {
        Self {
            elastic,
            view: Mutex::new(WorkerView::new(expected_workers)),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            closed: Notify::new(),
        }
    }

    pub fn state(&self) -> MembershipState {
        self.view.lock().state
    }

    pub fn view(&self) -> WorkerView {
        self.view.lock().clone()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Register a worker, return the view after registration.
    ///
    /// Registering a known rank again is idempotent and may update its endpoint. A new rank after
    /// the cluster is formed is a late join, accepted only in elastic mode.
    pub fn register(&self, rank: u32, endpoint: &str) -> Result<WorkerView> {
        let mut view = self.view.lock();

        if !view.state.is_serving() {
            return Err(EmbeddingError::ShuttingDown(view.state.to_string()).into());
        }

        if let Some(existing) = view.endpoints.get(&rank).cloned() {
            if existing != endpoint {
                info!(
                    "worker endpoint changed, rank: {}, old: {}, new: {}",
                    rank, existing, endpoint
                );
                view.endpoints.insert(rank, endpoint.to_string());
                view.version += 1;
            }

            return Ok(view.clone());
        }

        match view.state {
            MembershipState::Forming => {
                if rank >= view.expected_workers {
                    return Err(EmbeddingError::invalid_config(format!(
                        "rank out of range, rank: {}, expected_workers: {}",
                        rank, view.expected_workers
                    ))
                    .into());
                }

                view.endpoints.insert(rank, endpoint.to_string());
                view.version += 1;

                if view.endpoints.len() >= view.expected_workers as usize {
                    view.state = MembershipState::Active;
                    info!(
                        "all {} workers registered, cluster is active, version: {}",
                        view.expected_workers, view.version
                    );
                }
            }
            state if self.elastic => {
                view.endpoints.insert(rank, endpoint.to_string());
                view.expected_workers = view.expected_workers.max(rank + 1);
                view.state = MembershipState::Resharding;
                view.version += 1;

                info!(
                    "worker joined elastic cluster, rank: {}, from state: {}, version: {}",
                    rank, state, view.version
                );
            }
            state => {
                warn!("reject late join, rank: {}, state: {}", rank, state);
                return Err(EmbeddingError::LateJoin {
                    rank,
                    state: state.to_string(),
                }
                .into());
            }
        }

        Ok(view.clone())
    }

    /// Back to `Active` after resharding.
    pub fn finish_resharding(&self) -> Result<WorkerView> {
        let mut view = self.view.lock();

        if view.state != MembershipState::Resharding {
            error_bail!("cannot finish resharding in state {}", view.state);
        }

        view.state = MembershipState::Active;
        view.version += 1;

        Ok(view.clone())
    }

    /// Replace local view with the one published by scheduler.
    ///
    /// Local `Draining` and `Closed` are kept.
    pub fn adopt_view(&self, other: &WorkerView) {
        let mut view = self.view.lock();

        if !view.state.is_serving() || other.version < view.version {
            return;
        }

        *view = other.clone();
    }

    /// Mark a pull or push request in flight, the guard must be held until the request is done.
    pub fn begin_request(self: &Arc<Self>) -> Result<InFlightGuard> {
        let view = self.view.lock();

        if !view.state.is_serving() {
            return Err(EmbeddingError::ShuttingDown(view.state.to_string()).into());
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);

        Ok(InFlightGuard {
            coordinator: self.clone(),
        })
    }

    fn end_request(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut view = self.view.lock();
            self.try_close(&mut view);
        }
    }

    fn try_close(&self, view: &mut WorkerView) {
        if view.state == MembershipState::Draining && self.in_flight() == 0 {
            view.state = MembershipState::Closed;
            view.version += 1;

            info!("all in-flight requests done, state: {}", view.state);
            self.closed.notify_waiters();
        }
    }

    /// Stop accepting pull and push requests, return the state after the call.
    pub fn begin_drain(&self) -> MembershipState {
        let mut view = self.view.lock();

        if view.state.is_serving() {
            info!(
                "start draining, state: {}, in_flight: {}",
                view.state,
                self.in_flight()
            );

            view.state = MembershipState::Draining;
            view.version += 1;
        }

        self.try_close(&mut view);

        view.state
    }

    /// Wait until `Closed`, return false on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.closed.notified();

            if self.state() == MembershipState::Closed {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let closed = self.state() == MembershipState::Closed;

                if !closed {
                    warn!(
                        "drain timeout, in_flight: {}, timeout: {:?}",
                        self.in_flight(),
                        timeout
                    );
                }

                return closed;
            }
        }
    }
}

/// Decrease in-flight count on drop.
pub struct InFlightGuard {
    coordinator: Arc<Coordinator>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.coordinator.end_request();
    }
}
