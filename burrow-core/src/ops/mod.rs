//! Long-running operation engine.
//!
//! Every externally observable mutation runs inside an [`Operation`]:
//! task-class operations are plain background jobs, websocket-class
//! operations additionally expose secret-protected data channels (used by
//! migration). An operation goes `pending → running → {success, failure,
//! cancelled}` with exactly one terminal transition; a panic inside the run
//! closure becomes a failure without affecting other operations.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub mod revert;

pub use revert::Reverter;

/// Byte stream handed to a websocket-class operation channel.
pub type ChannelStream = DuplexStream;

type OpFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// The operation's main closure.
pub type RunFn = Box<dyn FnOnce(Operation) -> OpFuture + Send>;

/// Optional cancellation closure, invoked at most once.
pub type CancelFn = Box<dyn FnOnce(Operation) -> OpFuture + Send>;

/// Operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Plain background job.
    Task,
    /// Background job with secret-protected data channels.
    Websocket,
}

impl OperationClass {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Websocket => "websocket",
        }
    }
}

/// Operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status is final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }
}

/// Cancellation view handed to run closures and driver-call loops.
#[derive(Clone)]
pub struct OpContext {
    cancel: watch::Receiver<bool>,
    _guard: Option<Arc<watch::Sender<bool>>>,
}

impl OpContext {
    /// A context that never cancels (for synchronous request paths).
    #[must_use]
    pub fn background() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { cancel: rx, _guard: Some(Arc::new(tx)) }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Fail fast when cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                // Sender dropped without cancelling; never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

struct ChannelState {
    secret: String,
    used: bool,
    tx: mpsc::Sender<ChannelStream>,
    rx: Option<mpsc::Receiver<ChannelStream>>,
}

struct OpState {
    status: OperationStatus,
    err: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
}

struct OpInner {
    id: String,
    project: String,
    class: OperationClass,
    op_type: String,
    resources: HashMap<String, Vec<String>>,
    requestor: Option<String>,
    created_at: DateTime<Utc>,
    state: Mutex<OpState>,
    status_tx: watch::Sender<OperationStatus>,
    cancel_tx: watch::Sender<bool>,
    cancel_invoked: AtomicBool,
    run: Mutex<Option<RunFn>>,
    cancel_fn: Mutex<Option<CancelFn>>,
    channels: Mutex<HashMap<String, ChannelState>>,
}

/// Externally visible operation representation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationInfo {
    pub id: String,
    pub project: String,
    pub class: OperationClass,
    #[serde(rename = "type")]
    pub op_type: String,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub resources: HashMap<String, Vec<String>>,
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requestor: Option<String>,
}

/// A long-running operation handle. Clones share state.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OpInner>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

impl Operation {
    /// Create a pending operation and register it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        registry: &Registry,
        project: &str,
        class: OperationClass,
        op_type: &str,
        resources: HashMap<String, Vec<String>>,
        metadata: HashMap<String, serde_json::Value>,
        run: RunFn,
        cancel_fn: Option<CancelFn>,
        requestor: Option<String>,
    ) -> Self {
        let (status_tx, _) = watch::channel(OperationStatus::Pending);
        let (cancel_tx, _) = watch::channel(false);

        let op = Self {
            inner: Arc::new(OpInner {
                id: uuid::Uuid::new_v4().to_string(),
                project: project.to_string(),
                class,
                op_type: op_type.to_string(),
                resources,
                requestor,
                created_at: Utc::now(),
                state: Mutex::new(OpState {
                    status: OperationStatus::Pending,
                    err: None,
                    metadata,
                }),
                status_tx,
                cancel_tx,
                cancel_invoked: AtomicBool::new(false),
                run: Mutex::new(Some(run)),
                cancel_fn: Mutex::new(cancel_fn),
                channels: Mutex::new(HashMap::new()),
            }),
        };

        registry.insert(op.clone());
        op
    }

    /// Operation ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Operation class.
    #[must_use]
    pub fn class(&self) -> OperationClass {
        self.inner.class
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.inner.state.lock().expect("operation lock poisoned").status
    }

    /// Cancellation view for driver-call loops.
    #[must_use]
    pub fn context(&self) -> OpContext {
        OpContext { cancel: self.inner.cancel_tx.subscribe(), _guard: None }
    }

    /// URL path of the operation resource.
    #[must_use]
    pub fn url(&self) -> String {
        format!("/1.0/operations/{}", self.inner.id)
    }

    /// Merge a metadata key.
    pub fn set_metadata(&self, key: &str, value: serde_json::Value) {
        let mut state = self.inner.state.lock().expect("operation lock poisoned");
        state.metadata.insert(key.to_string(), value);
    }

    /// Snapshot for API rendering.
    #[must_use]
    pub fn info(&self) -> OperationInfo {
        let state = self.inner.state.lock().expect("operation lock poisoned");
        OperationInfo {
            id: self.inner.id.clone(),
            project: self.inner.project.clone(),
            class: self.inner.class,
            op_type: self.inner.op_type.clone(),
            status: state.status,
            created_at: self.inner.created_at,
            resources: self.inner.resources.clone(),
            metadata: state.metadata.clone(),
            err: state.err.clone(),
            requestor: self.inner.requestor.clone(),
        }
    }

    /// Start the operation: transition to running and spawn the run closure
    /// on its own task.
    pub fn start(&self) -> Result<()> {
        let run = self
            .inner
            .run
            .lock()
            .expect("operation lock poisoned")
            .take()
            .ok_or_else(|| Error::Internal("Operation already started".to_string()))?;

        self.transition(OperationStatus::Running, None);

        let op = self.clone();
        tokio::spawn(async move {
            // Run on a nested task so a panic surfaces as a join error
            // instead of taking the engine down.
            let inner = op.clone();
            let outcome = tokio::spawn(async move { run(inner).await }).await;

            match outcome {
                Ok(Ok(())) => op.transition(OperationStatus::Success, None),
                Ok(Err(Error::Cancelled)) => op.transition(OperationStatus::Cancelled, None),
                Ok(Err(e)) => op.transition(OperationStatus::Failure, Some(e.to_string())),
                Err(join_err) => {
                    warn!(id = %op.inner.id, "Operation run closure panicked");
                    op.transition(OperationStatus::Failure, Some(join_err.to_string()));
                }
            }
        });

        Ok(())
    }

    fn transition(&self, status: OperationStatus, err: Option<String>) {
        {
            let mut state = self.inner.state.lock().expect("operation lock poisoned");
            if state.status.is_terminal() {
                return;
            }

            // A cancel request turns any run outcome terminal state into
            // cancelled, matching what the caller observed.
            let status = if status.is_terminal()
                && *self.inner.cancel_tx.borrow()
                && status != OperationStatus::Success
            {
                OperationStatus::Cancelled
            } else {
                status
            };

            state.status = status;
            state.err = err;

            if status.is_terminal() {
                metrics::counter!("burrow_operations_total", "status" => status.as_str())
                    .increment(1);
                info!(id = %self.inner.id, op_type = %self.inner.op_type, status = %status.as_str(), "Operation finished");
            }

            self.inner.status_tx.send_replace(status);
        }

        if self.status().is_terminal() {
            // Terminal operations accept no more channel connections.
            self.inner.channels.lock().expect("operation lock poisoned").clear();
        }
    }

    /// Request cancellation: signal the run closure and invoke the cancel
    /// closure exactly once.
    pub async fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }

        self.inner.cancel_tx.send_replace(true);

        if self.inner.cancel_invoked.swap(true, Ordering::SeqCst) {
            return;
        }

        let cancel_fn = self.inner.cancel_fn.lock().expect("operation lock poisoned").take();
        if let Some(cancel_fn) = cancel_fn {
            if let Err(e) = cancel_fn(self.clone()).await {
                warn!(id = %self.inner.id, error = %e, "Operation cancel closure failed");
            }
        }
    }

    /// Block until the operation reaches a terminal state. Returns the
    /// operation error, if any.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.inner.status_tx.subscribe();

        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }

        self.result()
    }

    /// Like [`Self::wait`], but cancels the operation (once) when `ctx`
    /// fires, then keeps waiting for the terminal state.
    pub async fn wait_with_cancel(&self, ctx: &mut OpContext) -> Result<()> {
        let mut rx = self.inner.status_tx.subscribe();
        let mut cancel_requested = false;

        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                break;
            }

            if cancel_requested {
                if rx.changed().await.is_err() {
                    break;
                }
                continue;
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = ctx.cancelled() => {
                    cancel_requested = true;
                    self.cancel().await;
                }
            }
        }

        self.result()
    }

    fn result(&self) -> Result<()> {
        let state = self.inner.state.lock().expect("operation lock poisoned");
        match state.status {
            OperationStatus::Success => Ok(()),
            OperationStatus::Cancelled => Err(Error::Cancelled),
            OperationStatus::Failure => Err(Error::Internal(
                state.err.clone().unwrap_or_else(|| "Operation failed".to_string()),
            )),
            _ => Err(Error::Internal("Operation not finished".to_string())),
        }
    }

    // ========================
    // Websocket channels
    // ========================

    /// Register a named data channel with a fresh secret.
    pub fn register_channel(&self, name: &str) {
        let (tx, rx) = mpsc::channel(1);
        let secret = new_secret();

        let mut channels = self.inner.channels.lock().expect("operation lock poisoned");
        channels.insert(name.to_string(), ChannelState { secret, used: false, tx, rx: Some(rx) });
    }

    /// Take the stream receiver of a registered channel; the run closure
    /// consumes it to obtain the authenticated stream.
    pub fn take_channel(&self, name: &str) -> Result<mpsc::Receiver<ChannelStream>> {
        let mut channels = self.inner.channels.lock().expect("operation lock poisoned");
        channels
            .get_mut(name)
            .and_then(|ch| ch.rx.take())
            .ok_or_else(|| Error::Internal(format!("Operation channel {:?} not available", name)))
    }

    /// Per-channel secrets, for the operation metadata handed to the peer.
    #[must_use]
    pub fn channel_secrets(&self) -> HashMap<String, String> {
        let channels = self.inner.channels.lock().expect("operation lock poisoned");
        channels.iter().map(|(name, ch)| (name.clone(), ch.secret.clone())).collect()
    }

    /// Authenticate and attach a stream to a channel.
    ///
    /// Secrets are single-use per channel; a wrong or reused secret is
    /// `Forbidden`. May be called any number of times (across channels)
    /// before the operation reaches a terminal state.
    pub async fn connect(&self, channel: &str, secret: &str, stream: ChannelStream) -> Result<()> {
        if self.inner.class != OperationClass::Websocket {
            return Err(Error::BadRequest(
                "Operation does not accept websocket connections".to_string(),
            ));
        }

        if self.status().is_terminal() {
            return Err(Error::BadRequest("Operation already finished".to_string()));
        }

        let tx = {
            let mut channels = self.inner.channels.lock().expect("operation lock poisoned");
            let state = channels
                .get_mut(channel)
                .ok_or_else(|| Error::NotFound(format!("Operation channel {:?}", channel)))?;

            if state.used || state.secret != secret {
                return Err(Error::Forbidden("Invalid operation secret".to_string()));
            }

            state.used = true;
            state.tx.clone()
        };

        tx.send(stream)
            .await
            .map_err(|_| Error::Internal("Operation channel closed".to_string()))
    }
}

/// Generate a 256-bit hex secret.
fn new_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Registry of live operations.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, Operation>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, op: Operation) {
        let mut ops = self.inner.lock().expect("operation registry lock poisoned");
        ops.insert(op.id().to_string(), op);
    }

    /// Look up an operation by ID.
    pub fn get(&self, id: &str) -> Result<Operation> {
        let ops = self.inner.lock().expect("operation registry lock poisoned");
        ops.get(id).cloned().ok_or_else(|| Error::NotFound(format!("Operation {:?}", id)))
    }

    /// Snapshot of all known operations.
    #[must_use]
    pub fn list(&self) -> Vec<Operation> {
        let ops = self.inner.lock().expect("operation registry lock poisoned");
        ops.values().cloned().collect()
    }

    /// Drop a terminal operation from the registry.
    pub fn remove(&self, id: &str) {
        let mut ops = self.inner.lock().expect("operation registry lock poisoned");
        ops.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task_op(registry: &Registry, run: RunFn) -> Operation {
        Operation::create(
            registry,
            "default",
            OperationClass::Task,
            "test",
            HashMap::new(),
            HashMap::new(),
            run,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_success_path() {
        let registry = Registry::new();
        let op = task_op(&registry, Box::new(|_| Box::pin(async { Ok(()) })));

        assert_eq!(op.status(), OperationStatus::Pending);
        op.start().unwrap();
        op.wait().await.unwrap();
        assert_eq!(op.status(), OperationStatus::Success);

        // Exactly one terminal transition; a second start fails.
        assert!(op.start().is_err());
    }

    #[tokio::test]
    async fn test_failure_carries_error() {
        let registry = Registry::new();
        let op = task_op(
            &registry,
            Box::new(|_| Box::pin(async { Err(Error::BadRequest("boom".to_string())) })),
        );

        op.start().unwrap();
        let err = op.wait().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(op.status(), OperationStatus::Failure);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let registry = Registry::new();
        let op = task_op(&registry, Box::new(|_| Box::pin(async { panic!("kaboom") })));

        op.start().unwrap();
        assert!(op.wait().await.is_err());
        assert_eq!(op.status(), OperationStatus::Failure);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_run() {
        let registry = Registry::new();
        let op = task_op(
            &registry,
            Box::new(|op| {
                Box::pin(async move {
                    let mut ctx = op.context();
                    ctx.cancelled().await;
                    Err(Error::Cancelled)
                })
            }),
        );

        op.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        op.cancel().await;
        assert!(matches!(op.wait().await, Err(Error::Cancelled)));
        assert_eq!(op.status(), OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_channel_secret_is_single_use() {
        let registry = Registry::new();
        let op = Operation::create(
            &registry,
            "default",
            OperationClass::Websocket,
            "test",
            HashMap::new(),
            HashMap::new(),
            Box::new(|op| {
                Box::pin(async move {
                    let mut ctx = op.context();
                    ctx.cancelled().await;
                    Err(Error::Cancelled)
                })
            }),
            None,
            None,
        );

        op.register_channel("control");
        let mut rx = op.take_channel("control").unwrap();
        let secrets = op.channel_secrets();
        let secret = secrets.get("control").unwrap();
        assert_eq!(secret.len(), 64);

        op.start().unwrap();

        let (a, _b) = tokio::io::duplex(64);
        assert!(matches!(
            op.connect("control", "wrong", a).await,
            Err(Error::Forbidden(_))
        ));

        let (a, _b) = tokio::io::duplex(64);
        op.connect("control", secret, a).await.unwrap();
        assert!(rx.recv().await.is_some());

        // Second use of the same secret is rejected.
        let (a, _b) = tokio::io::duplex(64);
        assert!(matches!(
            op.connect("control", secret, a).await,
            Err(Error::Forbidden(_))
        ));

        op.cancel().await;
        let _ = op.wait().await;
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = Registry::new();
        let op = task_op(&registry, Box::new(|_| Box::pin(async { Ok(()) })));

        assert!(registry.get(op.id()).is_ok());
        assert!(registry.get("missing").is_err());

        registry.remove(op.id());
        assert!(registry.get(op.id()).is_err());
    }
}
