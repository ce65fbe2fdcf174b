//! Remember recent push sequence tokens to drop replayed pushes.
//!
//! A worker retries a push with the same token when the reply is lost, the second copy must not be
//! applied again. Tokens are kept per (worker, varname) in a bounded window, the oldest token is
//! forgotten when the window is full.
//!
//! A token is `Applying` from the moment the first copy starts until its gradients are applied. A
//! copy arriving in that window waits for the first one. It gets the first one's result if the
//! apply succeeds, and it applies the push itself if the first one fails.
//!
//! Token 0 means the push carries no token and is always applied.
use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use hashbrown::HashMap;
use tokio::sync::watch;

use grpc::embedding::PushResult;

/// Outcome published by the first copy, `None` while it is applying, `Some(None)` if it failed.
type Outcome = Option<Option<PushResult>>;

enum TokenState {
    Applying(watch::Receiver<Outcome>),
    Applied(PushResult),
}

#[derive(Default)]
struct TokenWindow {
    tokens: HashMap<u64, TokenState>,
    order: VecDeque<u64>,
}

impl TokenWindow {
    fn remove(&mut self, seq_id: u64) {
        if self.tokens.remove(&seq_id).is_some() {
            self.order.retain(|x| *x != seq_id);
        }
    }
}

/// What to do with an incoming push.
pub enum PushTicket {
    /// First copy of the push, apply it and report through the guard.
    Apply(PushGuard),

    /// Already applied, with the result of the first copy.
    Applied(PushResult),

    /// Another copy is applying, wait with `PushTracker::wait`.
    Applying(watch::Receiver<Outcome>),
}

pub struct PushTracker {
    max_records: usize,
    windows: DashMap<(u32, String), TokenWindow>,
}

impl PushTracker {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            windows: DashMap::new(),
        }
    }

    /// Start a push with token `seq_id` of `worker`.
    ///
    /// Check and record happen under the same lock, so of two copies racing on different
    /// connections only one gets `PushTicket::Apply`.
    pub fn begin(self: &Arc<Self>, worker: u32, varname: &str, seq_id: u64) -> PushTicket {
        let (sender, receiver) = watch::channel(None);

        if seq_id != 0 {
            let mut window = self
                .windows
                .entry((worker, varname.to_string()))
                .or_default();

            match window.tokens.get(&seq_id) {
                Some(TokenState::Applied(x)) => return PushTicket::Applied(x.clone()),
                Some(TokenState::Applying(x)) => return PushTicket::Applying(x.clone()),
                None => {}
            }

            window.tokens.insert(seq_id, TokenState::Applying(receiver));
            window.order.push_back(seq_id);

            while window.order.len() > self.max_records {
                if let Some(old) = window.order.pop_front() {
                    window.tokens.remove(&old);
                }
            }
        }

        PushTicket::Apply(PushGuard {
            tracker: self.clone(),
            worker,
            varname: varname.to_string(),
            seq_id,
            sender,
            finished: false,
        })
    }

    /// Wait for the copy that is applying. `None` if it failed, the caller should start again.
    pub async fn wait(mut receiver: watch::Receiver<Outcome>) -> Option<PushResult> {
        let outcome = {
            let res = receiver.wait_for(|x| x.is_some()).await;

            match res {
                Ok(x) => x.clone(),
                Err(_) => None,
            }
        };

        outcome.flatten()
    }

    fn complete(&self, worker: u32, varname: &str, seq_id: u64, result: Option<&PushResult>) {
        if seq_id == 0 {
            return;
        }

        if let Some(mut window) = self.windows.get_mut(&(worker, varname.to_string())) {
            match result {
                Some(x) => {
                    if let Some(state) = window.tokens.get_mut(&seq_id) {
                        *state = TokenState::Applied(x.clone());
                    }
                }
                None => window.remove(seq_id),
            }
        }
    }
}

/// Held by the copy that applies a push.
///
/// Dropping it without `finish` forgets the token and wakes the waiting copies, so a retry is
/// applied.
pub struct PushGuard {
    tracker: Arc<PushTracker>,
    worker: u32,
    varname: String,
    seq_id: u64,
    sender: watch::Sender<Outcome>,
    finished: bool,
}

impl PushGuard {
    /// The push is applied, later copies get `result`.
    pub fn finish(mut self, result: &PushResult) {
        self.tracker
            .complete(self.worker, &self.varname, self.seq_id, Some(result));
        self.sender.send_replace(Some(Some(result.clone())));
        self.finished = true;
    }
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker
                .complete(self.worker, &self.varname, self.seq_id, None);
            self.sender.send_replace(Some(None));
        }
    }
}
