//! In-flight operation registry.
//!
//! Long work (BIOS reads and writes, VM provisioning) runs on its own named
//! thread. The caller gets a [`WaitToken`] derived from the operation kind and
//! the target, so asking twice for the same thing on the same target finds the
//! running operation instead of starting another. Entries stay until a poll
//! sees them finished.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::cancel::Deadline;
use crate::error::ResultCode;
use crate::outcome::{Outcome, WaitToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    DeployBios,
    ReadBios,
    DeployVm,
}

impl OperationKind {
    pub fn tag(&self) -> &'static str {
        match self {
            OperationKind::DeployBios => "biosdeploy",
            OperationKind::ReadBios => "biosread",
            OperationKind::DeployVm => "vmdeploy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl WaitToken {
    pub fn for_operation(kind: OperationKind, target: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        target.hash(&mut hasher);
        WaitToken::from(format!("{}-{:016x}", kind.tag(), hasher.finish()))
    }
}

/// Snapshot of one registered operation, for diagnostics.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub token: WaitToken,
    pub kind: OperationKind,
    pub target: String,
    pub owner: String,
    pub running_for: Duration,
    pub finished: bool,
}

struct Operation {
    kind: OperationKind,
    target: String,
    owner: String,
    started: Instant,
    deadline: Deadline,
    result: Outcome,
    finished: bool,
}

impl Operation {
    fn info(&self, token: &WaitToken) -> OperationInfo {
        OperationInfo {
            token: token.clone(),
            kind: self.kind,
            target: self.target.clone(),
            owner: self.owner.clone(),
            running_for: self.started.elapsed(),
            finished: self.finished,
        }
    }
}

struct Shared {
    operations: Mutex<HashMap<WaitToken, Operation>>,
    finished: Condvar,
    watchdog: Duration,
}

#[derive(Clone)]
pub struct Tracker {
    shared: Arc<Shared>,
}

impl Tracker {
    /// `watchdog` is how long a cancel-and-wait blocks before it starts
    /// logging what it is waiting on.
    pub fn new(watchdog: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                operations: Mutex::new(HashMap::new()),
                finished: Condvar::new(),
                watchdog,
            }),
        }
    }

    /// Run `work` on a new thread unless the same kind of work is already
    /// running on `target`.
    ///
    /// Returns `Pending` with the token, or `AlreadyInProgress` with the token
    /// of the running operation.
    pub fn start<F>(&self, kind: OperationKind, target: &str, owner: &str, deadline: Deadline, work: F) -> Outcome
    where
        F: FnOnce(&Deadline) -> Outcome + Send + 'static,
    {
        let token = WaitToken::for_operation(kind, target);
        let mut operations = self.shared.operations.lock();

        if let Some(existing) = operations.get(&token) {
            if !existing.finished {
                return Outcome::new(ResultCode::AlreadyInProgress)
                    .with_token(token)
                    .with_resource(target);
            }
        }

        operations.insert(
            token.clone(),
            Operation {
                kind,
                target: target.to_string(),
                owner: owner.to_string(),
                started: Instant::now(),
                deadline: deadline.clone(),
                result: Outcome::pending(token.clone()).with_resource(target),
                finished: false,
            },
        );

        let tracker = self.clone();
        let worker_token = token.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", kind.tag(), target))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| work(&deadline)))
                    .unwrap_or_else(|_| Outcome::failed("worker panicked"));
                tracker.finish(&worker_token, result);
            });

        match spawned {
            Ok(_) => {
                info!(token = %token, kind = %kind, target = %target, owner = %owner, "Started operation");
                Outcome::pending(token).with_resource(target)
            }
            Err(err) => {
                operations.remove(&token);
                error!(kind = %kind, target = %target, error = %err, "Failed to spawn worker");
                Outcome::failed(format!("failed to spawn worker: {}", err)).with_resource(target)
            }
        }
    }

    fn finish(&self, token: &WaitToken, mut result: Outcome) {
        let mut operations = self.shared.operations.lock();
        if let Some(operation) = operations.get_mut(token) {
            if result.code == ResultCode::Pending {
                result = Outcome::failed("worker ended without a result");
            }
            result.token = Some(token.clone());
            if result.resource.is_none() {
                result.resource = Some(operation.target.clone());
            }
            info!(token = %token, target = %operation.target, code = %result.code, "Operation finished");
            operation.result = result;
            operation.finished = true;
        }
        drop(operations);
        self.shared.finished.notify_all();
    }

    /// Current state of an operation. A finished operation is forgotten once
    /// it has been reported.
    pub fn progress(&self, token: &WaitToken) -> Outcome {
        let mut operations = self.shared.operations.lock();
        let finished = operations.get(token).map(|operation| operation.finished);
        let reported = match finished {
            Some(true) => operations.remove(token).map(|operation| operation.result),
            Some(false) => operations.get(token).map(|operation| operation.result.clone()),
            None => None,
        };
        reported.unwrap_or_else(|| {
            Outcome::new(ResultCode::NotFound).with_message(format!("no operation with token {}", token))
        })
    }

    /// Block until the operation finishes or `timeout` passes, then report
    /// like [`Tracker::progress`].
    pub fn wait(&self, token: &WaitToken, timeout: Duration) -> Outcome {
        let until = Instant::now() + timeout;
        let mut operations = self.shared.operations.lock();
        while operations.get(token).is_some_and(|operation| !operation.finished) {
            if self.shared.finished.wait_until(&mut operations, until).timed_out() {
                break;
            }
        }
        drop(operations);
        self.progress(token)
    }

    pub fn is_running(&self, kind: OperationKind, target: &str) -> bool {
        let token = WaitToken::for_operation(kind, target);
        self.shared
            .operations
            .lock()
            .get(&token)
            .is_some_and(|operation| !operation.finished)
    }

    /// Cancel the running operation of `kind` on `target` and block until its
    /// worker acknowledges. Returns the operation's result, or `None` if
    /// nothing was running.
    pub fn cancel_and_wait(&self, kind: OperationKind, target: &str) -> Option<Outcome> {
        let token = WaitToken::for_operation(kind, target);
        let mut operations = self.shared.operations.lock();
        match operations.get(&token) {
            Some(operation) if !operation.finished => operation.deadline.cancel(),
            _ => return None,
        }
        info!(token = %token, target = %target, "Cancelling operation");

        let started = Instant::now();
        let mut next_report = started + self.shared.watchdog;
        while operations.get(&token).is_some_and(|operation| !operation.finished) {
            if !self
                .shared
                .finished
                .wait_until(&mut operations, next_report)
                .timed_out()
            {
                continue;
            }
            if let Some(operation) = operations.get(&token) {
                let info = operation.info(&token);
                warn!(
                    token = %token,
                    kind = %info.kind,
                    target = %info.target,
                    owner = %info.owner,
                    waited = ?started.elapsed(),
                    running_for = ?info.running_for,
                    "Operation has not acknowledged cancellation"
                );
            }
            next_report += self.shared.watchdog;
        }
        operations.get(&token).map(|operation| operation.result.clone())
    }

    pub fn operations(&self) -> Vec<OperationInfo> {
        let operations = self.shared.operations.lock();
        let mut all: Vec<OperationInfo> = operations
            .iter()
            .map(|(token, operation)| operation.info(token))
            .collect();
        all.sort_by(|a, b| a.token.cmp(&b.token));
        all
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("operations", &self.shared.operations.lock().len())
            .finish()
    }
}
