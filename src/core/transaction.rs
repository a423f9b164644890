//! Proxy transaction state.
//!
//! ```text
//! Init → Resolving → Attempting ⇄ WaitingResponse → Completed | TimedOut | Failed
//! ```
//!
//! A transaction has at most one outstanding attempt and reaches exactly one
//! terminal state. Once terminal, every mutating call fails with
//! [`ErrorKind::InvalidState`](crate::core::error::ErrorKind::InvalidState).
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use tokio::sync::watch;
use uuid::Uuid;

use crate::core::{
    app_config::ResponseInterest,
    destination::{Destination, DestinationKey},
    error::{ProxyError, ProxyResult},
    message::Request,
    normalization::NormalizationCookie,
};

/// Correlation id of a proxied request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(String);

impl TransactionId {
    /// Fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Init,
    Resolving,
    Attempting,
    WaitingResponse,
    Completed,
    TimedOut,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::TimedOut | TransactionState::Failed
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Init => "init",
            TransactionState::Resolving => "resolving",
            TransactionState::Attempting => "attempting",
            TransactionState::WaitingResponse => "waiting_response",
            TransactionState::Completed => "completed",
            TransactionState::TimedOut => "timed_out",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One inbound request being proxied
#[derive(Debug)]
pub struct ProxyTransaction {
    id: TransactionId,
    request: Request,
    mid_dialog: bool,
    interest: ResponseInterest,
    trunk: Option<String>,
    error_mapping: Option<String>,
    candidates: Vec<Destination>,
    attempts: usize,
    excluded: HashSet<DestinationKey>,
    current: Option<Destination>,
    cookie: Option<NormalizationCookie>,
    state: TransactionState,
    created_at: Instant,
}

impl ProxyTransaction {
    pub fn new(id: TransactionId, request: Request, interest: ResponseInterest) -> Self {
        let mid_dialog = request.is_mid_dialog();
        Self {
            id,
            request,
            mid_dialog,
            interest,
            trunk: None,
            error_mapping: None,
            candidates: Vec::new(),
            attempts: 0,
            excluded: HashSet::new(),
            current: None,
            cookie: None,
            state: TransactionState::Init,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// The inbound request as received; outbound copies are made per attempt
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_mid_dialog(&self) -> bool {
        self.mid_dialog
    }

    pub fn interest(&self) -> ResponseInterest {
        self.interest
    }

    pub fn trunk(&self) -> Option<&str> {
        self.trunk.as_deref()
    }

    pub fn error_mapping(&self) -> Option<&str> {
        self.error_mapping.as_deref()
    }

    pub fn candidates(&self) -> &[Destination] {
        &self.candidates
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn excluded(&self) -> &HashSet<DestinationKey> {
        &self.excluded
    }

    /// Destination of the attempt in progress
    pub fn current(&self) -> Option<&Destination> {
        self.current.as_ref()
    }

    pub fn cookie(&self) -> Option<&NormalizationCookie> {
        self.cookie.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn ensure_active(&self, operation: &str) -> ProxyResult<()> {
        if self.state.is_terminal() {
            return Err(ProxyError::invalid_state(format!(
                "cannot {operation}: transaction {} is already {}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Record the trunk and error-mapping policy chosen for this request
    pub fn route_via(&mut self, trunk: &str, error_mapping: Option<String>) -> ProxyResult<()> {
        self.ensure_active("select trunk")?;
        self.trunk = Some(trunk.to_string());
        self.error_mapping = error_mapping;
        Ok(())
    }

    pub fn begin_resolving(&mut self) -> ProxyResult<()> {
        self.ensure_active("resolve destinations")?;
        self.state = TransactionState::Resolving;
        Ok(())
    }

    pub fn set_candidates(&mut self, candidates: &[Destination]) -> ProxyResult<()> {
        self.ensure_active("set candidates")?;
        self.candidates = candidates.to_vec();
        Ok(())
    }

    /// Start a new attempt. Fails if the transaction is terminal or another
    /// attempt is still outstanding. Returns the 1-based attempt number.
    pub fn begin_attempt(&mut self, destination: &Destination) -> ProxyResult<usize> {
        self.ensure_active("start attempt")?;
        if self.state == TransactionState::WaitingResponse {
            return Err(ProxyError::invalid_state(format!(
                "transaction {} already has an outstanding attempt",
                self.id
            )));
        }
        self.attempts += 1;
        self.current = Some(destination.clone());
        self.state = TransactionState::Attempting;
        Ok(self.attempts)
    }

    pub fn attempt_sent(&mut self) -> ProxyResult<()> {
        self.ensure_active("mark attempt sent")?;
        if self.state != TransactionState::Attempting {
            return Err(ProxyError::invalid_state(format!(
                "transaction {} has no attempt to send (state {})",
                self.id, self.state
            )));
        }
        self.state = TransactionState::WaitingResponse;
        Ok(())
    }

    /// Close the outstanding attempt as failed and exclude its destination
    pub fn attempt_failed(&mut self, destination: &Destination) -> ProxyResult<()> {
        self.ensure_active("fail attempt")?;
        self.excluded.insert(destination.key());
        self.current = None;
        self.state = TransactionState::Attempting;
        Ok(())
    }

    pub fn bind_cookie(&mut self, cookie: NormalizationCookie) -> ProxyResult<()> {
        self.ensure_active("bind normalization")?;
        self.cookie = Some(cookie);
        Ok(())
    }

    fn finish(&mut self, state: TransactionState) -> ProxyResult<()> {
        self.ensure_active("finish")?;
        self.state = state;
        self.current = None;
        Ok(())
    }

    pub fn complete(&mut self) -> ProxyResult<()> {
        self.finish(TransactionState::Completed)
    }

    pub fn fail(&mut self) -> ProxyResult<()> {
        self.finish(TransactionState::Failed)
    }

    pub fn time_out(&mut self) -> ProxyResult<()> {
        self.finish(TransactionState::TimedOut)
    }
}

/// Hooks the trunk manager uses to record attempt progress on a transaction
pub trait AttemptTracker: Send + Sync {
    fn transaction_id(&self) -> TransactionId;
    fn resolving(&self) -> ProxyResult<()>;
    fn candidates(&self, candidates: &[Destination]) -> ProxyResult<()>;
    fn begin_attempt(&self, destination: &Destination) -> ProxyResult<usize>;
    fn attempt_sent(&self) -> ProxyResult<()>;
    fn attempt_failed(&self, destination: &Destination) -> ProxyResult<()>;
    fn bind_cookie(&self, cookie: NormalizationCookie) -> ProxyResult<()>;
}

struct HandleInner {
    id: TransactionId,
    transaction: Mutex<ProxyTransaction>,
    state_tx: watch::Sender<TransactionState>,
}

/// Shared handle to a transaction. The lock is only held for the duration of
/// a synchronous state update, never across an await point.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<HandleInner>,
}

impl TransactionHandle {
    pub fn new(transaction: ProxyTransaction) -> Self {
        let (state_tx, _) = watch::channel(transaction.state());
        Self {
            inner: Arc::new(HandleInner {
                id: transaction.id().clone(),
                transaction: Mutex::new(transaction),
                state_tx,
            }),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.inner.id
    }

    fn lock(&self) -> MutexGuard<'_, ProxyTransaction> {
        self.inner
            .transaction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` with exclusive access, then publish the resulting state
    pub fn with<R>(&self, f: impl FnOnce(&mut ProxyTransaction) -> R) -> R {
        let mut transaction = self.lock();
        let result = f(&mut transaction);
        let state = transaction.state();
        drop(transaction);
        self.inner.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        result
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state()
    }

    pub fn attempts(&self) -> usize {
        self.lock().attempts()
    }

    pub fn request(&self) -> Request {
        self.lock().request().clone()
    }

    pub fn cookie(&self) -> Option<NormalizationCookie> {
        self.lock().cookie().cloned()
    }

    /// Resolves once the transaction reaches a terminal state
    pub async fn wait_terminal(&self) -> TransactionState {
        let mut rx = self.inner.state_tx.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl AttemptTracker for TransactionHandle {
    fn transaction_id(&self) -> TransactionId {
        self.id().clone()
    }

    fn resolving(&self) -> ProxyResult<()> {
        self.with(|tx| tx.begin_resolving())
    }

    fn candidates(&self, candidates: &[Destination]) -> ProxyResult<()> {
        self.with(|tx| tx.set_candidates(candidates))
    }

    fn begin_attempt(&self, destination: &Destination) -> ProxyResult<usize> {
        self.with(|tx| tx.begin_attempt(destination))
    }

    fn attempt_sent(&self) -> ProxyResult<()> {
        self.with(|tx| tx.attempt_sent())
    }

    fn attempt_failed(&self, destination: &Destination) -> ProxyResult<()> {
        self.with(|tx| tx.attempt_failed(destination))
    }

    fn bind_cookie(&self, cookie: NormalizationCookie) -> ProxyResult<()> {
        self.with(|tx| tx.bind_cookie(cookie))
    }
}
