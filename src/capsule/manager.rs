//! Capsule manager: lifecycle state machine, handshake gate and request
//! dispatcher for one long-lived tool process.
//!
//! ```text
//!   CREATED ──┐
//!   CRASHED ──┼─ start() ─► STARTING ─┬─ hello ────► READY ─ stop() ─► STOPPED
//!   STOPPED ──┘                       ├─ timeout ──► CRASHED
//!                                     └─ stop() ───► STOPPED
//! ```
//!
//! State, process slot, pending calls and the request counter are guarded
//! separately; no path holds two of them at once.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};
use super::codec::encode_line;
use super::context::CallContext;
use super::demux::PendingCalls;
use super::errors::CapsuleError;
use super::logger::{CapsuleLogger, TracingLogger};
use super::process::{self, CallChannel, CapsuleProcess};
use super::types::{CapsuleState, HelloNotification, HelloParams, JsonRpcRequest, JsonRpcResponse, ToolCallResult};
use crate::manifest::ToolManifest;

// ─── Process Slot ────────────────────────────────────────────────────────────

/// The process owned by the current start attempt, tagged with its
/// generation so a stale attempt never tears down a newer process.
#[derive(Debug, Default)]
enum ProcessSlot {
    #[default]
    Empty,
    Launching {
        generation: u64,
        lifetime: CancellationToken,
    },
    Running {
        generation: u64,
        process: CapsuleProcess,
    },
}

impl ProcessSlot {
    fn generation(&self) -> Option<u64> {
        match self {
            ProcessSlot::Empty => None,
            ProcessSlot::Launching { generation, .. } | ProcessSlot::Running { generation, .. } => {
                Some(*generation)
            }
        }
    }
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Owns one capsule process and everything needed to talk to it.
pub struct CapsuleManager {
    manifest: ToolManifest,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn CapsuleLogger>,
    state: RwLock<CapsuleState>,
    process: Mutex<ProcessSlot>,
    pending: Arc<PendingCalls>,
    next_id: AtomicI64,
    generation: AtomicU64,
}

impl CapsuleManager {
    pub fn new(manifest: ToolManifest) -> Self {
        Self {
            manifest,
            clock: Arc::new(SystemClock),
            logger: Arc::new(TracingLogger),
            state: RwLock::new(CapsuleState::Created),
            process: Mutex::new(ProcessSlot::Empty),
            pending: PendingCalls::new(),
            next_id: AtomicI64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn CapsuleLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn tool_name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &ToolManifest {
        &self.manifest
    }

    pub fn startup_timeout(&self) -> Duration {
        self.manifest.startup_timeout()
    }

    pub fn state(&self) -> CapsuleState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CapsuleState::Ready
    }

    /// OS pid of the live capsule process, if any.
    pub fn pid(&self) -> Option<u32> {
        match &*self.lock_process() {
            ProcessSlot::Running { process, .. } => process.pid(),
            _ => None,
        }
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    // ─── Start ───────────────────────────────────────────────────────────

    /// Launch the capsule and wait for its `orla.hello`.
    ///
    /// Legal from `CREATED`, `CRASHED` and `STOPPED`; any other state is
    /// rejected without touching the process.
    pub async fn start(&self) -> Result<HelloParams, CapsuleError> {
        let generation = self.begin_start()?;
        let lifetime = CancellationToken::new();
        {
            let mut slot = self.lock_process();
            *slot = ProcessSlot::Launching {
                generation,
                lifetime: lifetime.clone(),
            };
        }
        if self.state() != CapsuleState::Starting {
            self.release_slot(generation);
            return Err(CapsuleError::HandshakeCancelled {
                tool: self.manifest.name.clone(),
            });
        }

        let launched = process::launch(
            &self.manifest,
            lifetime.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.logger),
        );

        let (process, hello_rx) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.release_slot(generation);
                self.transition(CapsuleState::Starting, CapsuleState::Crashed);
                self.logger.error(
                    "Failed to start capsule",
                    &[("tool", &self.manifest.name), ("error", &e)],
                );
                return Err(e);
            }
        };

        // Stop() may have emptied the slot while the child was spawning.
        let orphan = {
            let mut slot = self.lock_process();
            let ours = matches!(
                &*slot,
                ProcessSlot::Launching { generation: g, .. } if *g == generation
            );
            if ours {
                *slot = ProcessSlot::Running {
                    generation,
                    process,
                };
                None
            } else {
                Some(process)
            }
        };

        if let Some(orphan) = orphan {
            self.shutdown_logged(orphan).await;
            return Err(CapsuleError::HandshakeCancelled {
                tool: self.manifest.name.clone(),
            });
        }

        self.await_handshake(generation, lifetime, hello_rx).await
    }

    /// CAS into `STARTING` from a startable state and claim the next
    /// attempt generation under the same state lock.
    fn begin_start(&self) -> Result<u64, CapsuleError> {
        let (previous, generation) = {
            let mut state = self.write_state();
            if !state.can_start() {
                return Err(CapsuleError::InvalidState {
                    tool: self.manifest.name.clone(),
                    state: *state,
                });
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (std::mem::replace(&mut *state, CapsuleState::Starting), generation)
        };
        self.log_transition(previous, CapsuleState::Starting);
        Ok(generation)
    }

    /// Race the hello against the startup timeout and the lifetime.
    async fn await_handshake(
        &self,
        generation: u64,
        lifetime: CancellationToken,
        mut hello_rx: mpsc::Receiver<HelloNotification>,
    ) -> Result<HelloParams, CapsuleError> {
        let timeout = self.manifest.startup_timeout();
        let timer = self.clock.after(timeout);

        tokio::select! {
            biased;

            _ = lifetime.cancelled() => {
                self.transition(CapsuleState::Starting, CapsuleState::Stopped);
                Err(CapsuleError::HandshakeCancelled {
                    tool: self.manifest.name.clone(),
                })
            }

            hello = hello_rx.recv() => match hello {
                Some(hello) => {
                    if !self.transition(CapsuleState::Starting, CapsuleState::Ready) {
                        self.teardown(generation).await;
                        return Err(CapsuleError::HandshakeCancelled {
                            tool: self.manifest.name.clone(),
                        });
                    }
                    let capabilities = hello.params.capabilities.join(",");
                    self.logger.info(
                        "Capsule handshake received",
                        &[
                            ("tool", &self.manifest.name),
                            ("version", &hello.params.version),
                            ("capabilities", &capabilities),
                        ],
                    );
                    Ok(hello.params)
                }
                None => {
                    self.fail_start(generation).await;
                    Err(CapsuleError::HandshakeAborted {
                        tool: self.manifest.name.clone(),
                    })
                }
            },

            _ = timer => {
                self.fail_start(generation).await;
                Err(CapsuleError::HandshakeTimeout {
                    tool: self.manifest.name.clone(),
                    timeout_ms: duration_ms(timeout),
                })
            }
        }
    }

    /// Mark the attempt `CRASHED` and tear down its process.
    async fn fail_start(&self, generation: u64) {
        let slot = self.take_slot(generation);
        self.transition(CapsuleState::Starting, CapsuleState::Crashed);
        if let Some(ProcessSlot::Running { process, .. }) = slot {
            self.shutdown_logged(process).await;
        }
    }

    async fn teardown(&self, generation: u64) {
        if let Some(ProcessSlot::Running { process, .. }) = self.take_slot(generation) {
            self.shutdown_logged(process).await;
        }
    }

    async fn shutdown_logged(&self, process: CapsuleProcess) {
        if let Err(e) = process.shutdown(&self.manifest.name, self.logger.as_ref()).await {
            self.logger.error(
                "Failed to tear down capsule",
                &[("tool", &self.manifest.name), ("error", &e)],
            );
        }
    }

    // ─── Stop ────────────────────────────────────────────────────────────

    /// Stop the capsule. Legal from any state; a no-op once `STOPPED`.
    ///
    /// Kill and wait failures are returned, but the manager still ends up
    /// `STOPPED`.
    pub async fn stop(&self) -> Result<(), CapsuleError> {
        let Some(observed) = self.begin_stop() else {
            return Ok(());
        };

        let result = match self.take_slot_through(observed) {
            None | Some(ProcessSlot::Empty) => Ok(()),
            Some(ProcessSlot::Launching { lifetime, .. }) => {
                lifetime.cancel();
                self.pending.drain();
                Ok(())
            }
            Some(ProcessSlot::Running { process, .. }) => {
                process.cancel();
                let aborted = self.pending.drain();
                if aborted > 0 {
                    self.logger.debug(
                        "Aborting in-flight calls",
                        &[("tool", &self.manifest.name), ("count", &aborted)],
                    );
                }
                process.shutdown(&self.manifest.name, self.logger.as_ref()).await
            }
        };

        self.finish_stop(observed);
        result
    }

    /// The newest attempt generation, or `None` if already `STOPPED`.
    fn begin_stop(&self) -> Option<u64> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == CapsuleState::Stopped {
            return None;
        }
        Some(self.generation.load(Ordering::SeqCst))
    }

    /// Move to `STOPPED` unless a newer attempt began after `observed`.
    fn finish_stop(&self, observed: u64) {
        let previous = {
            let mut state = self.write_state();
            if self.generation.load(Ordering::SeqCst) != observed {
                return;
            }
            std::mem::replace(&mut *state, CapsuleState::Stopped)
        };
        self.log_transition(previous, CapsuleState::Stopped);
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Send a `tools/call` request and wait for the correlated response.
    ///
    /// The response may itself carry a JSON-RPC error; that is the caller's
    /// to inspect.
    pub async fn call_tool(
        &self,
        ctx: &CallContext,
        arguments: serde_json::Value,
    ) -> Result<JsonRpcResponse, CapsuleError> {
        let mut deadline = std::pin::pin!(self.deadline(ctx));

        let Some(channel) = self.ready_channel() else {
            return Err(CapsuleError::NotReady {
                tool: self.manifest.name.clone(),
                state: self.state(),
            });
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut call = self.pending.register(id);

        let request = JsonRpcRequest::tools_call(id, &self.manifest.name, arguments);
        let frame = encode_line(&request).map_err(|e| CapsuleError::EncodeFailed {
            tool: self.manifest.name.clone(),
            id,
            reason: e.to_string(),
        })?;

        // Waiting for the pipe is bounded by the caller like any other wait.
        let mut stdin = tokio::select! {
            biased;
            _ = channel.lifetime.cancelled() => return Err(self.aborted(id)),
            _ = ctx.cancelled() => return Err(self.cancelled(id)),
            _ = &mut deadline => return Err(self.timed_out(ctx, id)),
            guard = channel.stdin.lock() => guard,
        };

        // Once the pipe is ours a frame is never abandoned half-written; only
        // the process going away interrupts the write.
        tokio::select! {
            biased;
            _ = channel.lifetime.cancelled() => return Err(self.aborted(id)),
            written = stdin.write_frame(&frame) => {
                written.map_err(|e| CapsuleError::WriteFailed {
                    tool: self.manifest.name.clone(),
                    id,
                    reason: e.to_string(),
                })?;
            }
        }
        drop(stdin);

        tokio::select! {
            biased;
            response = call.response() => response.map_err(|_| self.aborted(id)),
            _ = channel.lifetime.cancelled() => Err(self.aborted(id)),
            _ = ctx.cancelled() => Err(self.cancelled(id)),
            _ = &mut deadline => Err(self.timed_out(ctx, id)),
        }
    }

    /// Call the tool and fold the outcome into a [`ToolCallResult`].
    pub async fn invoke(&self, ctx: &CallContext, arguments: serde_json::Value) -> ToolCallResult {
        let started = self.clock.now();
        let outcome = self.call_tool(ctx, arguments).await;
        let elapsed = duration_ms(self.clock.now().saturating_duration_since(started));

        match outcome {
            Ok(response) => ToolCallResult::from_response(&self.manifest.name, response, elapsed),
            Err(e) => ToolCallResult::from_error(&self.manifest.name, &e, elapsed),
        }
    }

    /// Deadline for a call, started now on the manager's clock.
    fn deadline(&self, ctx: &CallContext) -> impl std::future::Future<Output = ()> {
        let timer = ctx.timeout().map(|t| self.clock.after(t));
        async move {
            match timer {
                Some(timer) => timer.await,
                None => std::future::pending().await,
            }
        }
    }

    /// Stdin and lifetime of the live process, if the manager is `READY`.
    fn ready_channel(&self) -> Option<CallChannel> {
        if self.state() != CapsuleState::Ready {
            return None;
        }
        match &*self.lock_process() {
            ProcessSlot::Running { process, .. } => Some(process.channel()),
            _ => None,
        }
    }

    fn aborted(&self, id: i64) -> CapsuleError {
        CapsuleError::CallAborted {
            tool: self.manifest.name.clone(),
            id,
        }
    }

    fn cancelled(&self, id: i64) -> CapsuleError {
        CapsuleError::CallCancelled {
            tool: self.manifest.name.clone(),
            id,
        }
    }

    fn timed_out(&self, ctx: &CallContext, id: i64) -> CapsuleError {
        CapsuleError::CallTimeout {
            tool: self.manifest.name.clone(),
            id,
            timeout_ms: ctx.timeout().map(duration_ms).unwrap_or_default(),
        }
    }

    // ─── State & Slot Helpers ────────────────────────────────────────────

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, CapsuleState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move `from` → `to` only if the state is still `from`.
    fn transition(&self, from: CapsuleState, to: CapsuleState) -> bool {
        {
            let mut state = self.write_state();
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.log_transition(from, to);
        true
    }

    fn log_transition(&self, old: CapsuleState, new: CapsuleState) {
        if old != new {
            self.logger.debug(
                "Capsule state changed",
                &[
                    ("tool", &self.manifest.name),
                    ("old_state", &old),
                    ("new_state", &new),
                ],
            );
        }
    }

    fn lock_process(&self) -> MutexGuard<'_, ProcessSlot> {
        self.process.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the slot if it still belongs to `generation`.
    fn take_slot(&self, generation: u64) -> Option<ProcessSlot> {
        let mut slot = self.lock_process();
        if slot.generation() == Some(generation) {
            Some(std::mem::take(&mut *slot))
        } else {
            None
        }
    }

    /// Take the slot unless it belongs to an attempt newer than `observed`.
    fn take_slot_through(&self, observed: u64) -> Option<ProcessSlot> {
        let mut slot = self.lock_process();
        match slot.generation() {
            Some(generation) if generation > observed => None,
            _ => Some(std::mem::take(&mut *slot)),
        }
    }

    fn release_slot(&self, generation: u64) {
        let _ = self.take_slot(generation);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
