//! Protocol client for one agent process.
//!
//! The client owns both ends of the agent's stdio:
//!
//! - a **writer task** drains an unbounded queue of request lines into stdin,
//!   so sending is a synchronous enqueue that never waits on the pipe;
//! - a **reader task** feeds stdout chunks through a [`FrameReader`], decodes
//!   each frame into an [`InboundEvent`], routes it to whoever waits on its
//!   correlation id, and publishes it on the client's [`EventBus`].
//!
//! # Routing
//!
//! Every correlation id someone cares about has a *route*: an unbounded
//! channel of [`EventMsg`]. [`ProtocolClient::send_input`] opens the route
//! *before* writing the request, so events that arrive before the caller gets
//! around to [`ProtocolClient::await_completion`] are buffered, not lost.
//! The waiter holds a [`Route`] guard; dropping it (on completion, on error,
//! or because the caller dropped the future) removes the route.
//!
//! # Teardown
//!
//! When stdout hits EOF or [`ProtocolClient::cancel`] is called, every route's
//! sender is dropped. Waiters drain whatever was already buffered and then see
//! the channel close, which they report as `ProcessExited` or `Cancelled`
//! depending on which happened first.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::config::{inactivity_window, BridgeConfig, SessionOptions};
use crate::error::{BridgeError, Result};
use crate::event_bus::{EventBus, Subscription};
use crate::logging::{Direction, Transcript};
use crate::turn::{ApprovalDecision, ApprovalRequest, PendingTurn, TurnStep};

use super::frame::FrameReader;
use super::types::{EventMsg, InboundEvent, InputItem, Op, RawEvent, Submission};

const READ_CHUNK: usize = 8 * 1024;

/// How a `configure` call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// The agent sent `session_configured`.
    Acknowledged,
    /// Nothing arrived within the grace period; the session is treated as
    /// configured anyway because older agent builds never acknowledge.
    AssumedAfterGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ProcessExited,
    Cancelled,
}

#[derive(Default)]
struct RouteSlot {
    /// Dropped on teardown so waiters see the channel close.
    tx: Option<mpsc::UnboundedSender<EventMsg>>,
    /// Present until a waiter attaches.
    rx: Option<mpsc::UnboundedReceiver<EventMsg>>,
}

#[derive(Default)]
struct Routes {
    slots: HashMap<String, RouteSlot>,
    closed: Option<CloseReason>,
}

struct Shared {
    session_id: String,
    config: BridgeConfig,
    outbound: mpsc::UnboundedSender<String>,
    routes: Mutex<Routes>,
    approvals: Mutex<HashMap<String, ApprovalRequest>>,
    configured: AtomicBool,
    closed: watch::Sender<bool>,
    events: EventBus<InboundEvent>,
    transcript: Transcript,
}

/// Drives one agent process over the line-delimited JSON protocol.
pub struct ProtocolClient {
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl ProtocolClient {
    /// Start a client over the agent's stdin (`writer`) and stdout (`reader`).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<W, R>(
        session_id: impl Into<String>,
        writer: W,
        reader: R,
        config: BridgeConfig,
        transcript: Transcript,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            session_id: session_id.into(),
            config,
            outbound,
            routes: Mutex::new(Routes::default()),
            approvals: Mutex::new(HashMap::new()),
            configured: AtomicBool::new(false),
            closed,
            events: EventBus::new(),
            transcript,
        });

        let writer_task = tokio::spawn(write_loop(
            shared.session_id.clone(),
            writer,
            outbound_rx,
            shared.transcript.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), reader));

        Self {
            shared,
            reader_task,
            writer_task,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn is_configured(&self) -> bool {
        self.shared.configured.load(Ordering::SeqCst)
    }

    /// True once stdout has closed or the client was cancelled.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolve once stdout has closed or the client was cancelled.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Receive every inbound event from now on. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> Subscription<InboundEvent> {
        self.shared.events.subscribe()
    }

    /// Approval requests the agent is currently blocked on.
    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        let approvals = lock(&self.shared.approvals);
        let mut pending: Vec<ApprovalRequest> = approvals.values().cloned().collect();
        pending.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        pending
    }

    /// Correlation ids with an open route (runs sent or awaited and not yet finished).
    pub fn active_runs(&self) -> usize {
        lock(&self.shared.routes).slots.len()
    }

    /// Send `configure_session` and wait for the agent to acknowledge it.
    ///
    /// Resolves with [`ConfigureOutcome::AssumedAfterGrace`] if neither
    /// `session_configured` nor `error` arrives within the configured grace
    /// period.
    pub async fn configure(&self, cwd: &str, options: SessionOptions) -> Result<ConfigureOutcome> {
        let id = new_correlation_id();
        let mut route = self.shared.attach(&id)?;
        self.shared.submit(&Submission::new(
            id.clone(),
            Op::ConfigureSession {
                options,
                cwd: cwd.to_string(),
            },
        ))?;

        let grace = self.shared.config.configure_grace();
        let deadline = Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, route.recv()).await {
                Err(_) => {
                    log::warn!(
                        "No configure acknowledgment from session {} within {}ms, assuming configured",
                        self.shared.session_id,
                        grace.as_millis()
                    );
                    self.shared.configured.store(true, Ordering::SeqCst);
                    return Ok(ConfigureOutcome::AssumedAfterGrace);
                }
                Ok(None) => return Err(self.shared.close_error(&id)),
                Ok(Some(EventMsg::SessionConfigured)) => {
                    log::info!("Session {} configured", self.shared.session_id);
                    self.shared.configured.store(true, Ordering::SeqCst);
                    return Ok(ConfigureOutcome::Acknowledged);
                }
                Ok(Some(EventMsg::Error { message })) => {
                    return Err(BridgeError::Protocol {
                        correlation_id: id,
                        message,
                    })
                }
                Ok(Some(_)) => {}
            }
        }
    }

    /// Write a `user_input` request and return its run id without waiting.
    ///
    /// A fresh run id is generated when none is given. Events for the run are
    /// buffered until [`await_completion`](Self::await_completion) picks them up.
    pub fn send_input(&self, text: &str, run_id: Option<String>) -> Result<String> {
        let run_id = run_id.unwrap_or_else(new_correlation_id);
        let opened = self.shared.open(&run_id);

        let submission = Submission::new(
            run_id.clone(),
            Op::UserInput {
                items: vec![InputItem::Text {
                    text: text.to_string(),
                }],
            },
        );
        if let Err(e) = self.shared.submit(&submission) {
            if opened {
                self.shared.remove_route(&run_id);
            }
            return Err(e);
        }

        log::debug!("Session {} sent input for run {}", self.shared.session_id, run_id);
        Ok(run_id)
    }

    /// Wait for `run_id` to finish and return its accumulated agent messages.
    ///
    /// Fails with `Protocol` on an `error` event, with `Timeout` when no event
    /// for the run arrives within `inactivity_timeout_ms` of the previous one
    /// (zero or negative disables the timeout), and with `ProcessExited` or
    /// `Cancelled` when the session goes away first. While the run waits on an
    /// approval decision the timeout is not armed at all.
    pub async fn await_completion(&self, run_id: &str, inactivity_timeout_ms: i64) -> Result<String> {
        let window = inactivity_window(inactivity_timeout_ms);
        let mut route = self.shared.attach(run_id)?;
        let mut turn = PendingTurn::new(run_id, self.shared.session_id.as_str());

        loop {
            let next = match window.filter(|_| turn.timer_armed()) {
                Some(window) => match tokio::time::timeout(window, route.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        log::warn!(
                            "Run {} in session {} timed out after {} events",
                            run_id,
                            self.shared.session_id,
                            turn.events_seen()
                        );
                        return Err(turn.time_out(window));
                    }
                },
                None => route.recv().await,
            };

            let Some(msg) = next else {
                return Err(self.shared.close_error(run_id));
            };

            match turn.observe(&msg) {
                TurnStep::Continue => {}
                TurnStep::Completed(text) => {
                    log::info!("Run {} completed", run_id);
                    return Ok(text);
                }
                TurnStep::Failed(message) => {
                    log::warn!("Run {} failed: {}", run_id, message);
                    return Err(BridgeError::Protocol {
                        correlation_id: run_id.to_string(),
                        message,
                    });
                }
            }
        }
    }

    /// Answer an approval request. Does not wait for the agent.
    pub fn send_approval_decision(&self, decision: &ApprovalDecision) -> Result<()> {
        let known = lock(&self.shared.approvals)
            .remove(&decision.call_id)
            .is_some();
        if !known {
            log::warn!(
                "Sending decision for unknown approval {} in session {}",
                decision.call_id,
                self.shared.session_id
            );
        }
        self.shared
            .submit(&Submission::new(new_correlation_id(), decision.to_op()))
    }

    /// Orphan every pending run with a `Cancelled` outcome and refuse new input.
    pub fn cancel(&self) {
        self.shared.close(CloseReason::Cancelled);
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Shared {
    /// Make sure a route exists for `id`. Returns true if it was created.
    fn open(&self, id: &str) -> bool {
        let mut routes = lock(&self.routes);
        let closed = routes.closed.is_some();
        if routes.slots.contains_key(id) {
            return false;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.slots.insert(
            id.to_string(),
            RouteSlot {
                // A closed client hands out routes that are already closed.
                tx: (!closed).then_some(tx),
                rx: Some(rx),
            },
        );
        true
    }

    /// Take the receiving end of `id`'s route.
    fn attach(self: &Arc<Self>, id: &str) -> Result<Route> {
        self.open(id);
        let rx = lock(&self.routes)
            .slots
            .get_mut(id)
            .and_then(|slot| slot.rx.take())
            .ok_or_else(|| BridgeError::AlreadyAwaited(id.to_string()))?;
        Ok(Route {
            shared: Arc::clone(self),
            id: id.to_string(),
            rx,
        })
    }

    fn remove_route(&self, id: &str) {
        lock(&self.routes).slots.remove(id);
    }

    fn submit(&self, submission: &Submission) -> Result<()> {
        if let Some(reason) = lock(&self.routes).closed {
            return Err(BridgeError::Write(match reason {
                CloseReason::ProcessExited => "agent process has exited".to_string(),
                CloseReason::Cancelled => "session was cancelled".to_string(),
            }));
        }
        let line = submission.to_line()?;
        self.outbound
            .send(line)
            .map_err(|_| BridgeError::Write("agent stdin is closed".to_string()))
    }

    fn handle_frame(&self, value: serde_json::Value) {
        let line = value.to_string();
        self.transcript.record(Direction::Stdout, &line);
        let Some(raw) = RawEvent::from_value(value) else {
            log::debug!("Ignoring non-event frame in session {}: {}", self.session_id, line);
            return;
        };
        self.dispatch(InboundEvent::new(raw));
    }

    fn dispatch(&self, event: InboundEvent) {
        let id = event.correlation_id();
        log::debug!(
            "Session {} event {} for {}",
            self.session_id,
            event.raw.event_type,
            id
        );

        if let Some(request) = ApprovalRequest::from_event(id, &event.msg) {
            lock(&self.approvals).insert(request.call_id.clone(), request);
        } else if event.msg.is_terminal() {
            lock(&self.approvals).retain(|_, request| request.run_id != id);
        }

        if let Some(tx) = lock(&self.routes)
            .slots
            .get(id)
            .and_then(|slot| slot.tx.as_ref())
        {
            let _ = tx.send(event.msg.clone());
        }

        self.events.publish(event);
    }

    /// Drop every route's sender. The first reason recorded wins.
    fn close(&self, reason: CloseReason) {
        {
            let mut routes = lock(&self.routes);
            if routes.closed.is_none() {
                log::info!("Session {} closed: {:?}", self.session_id, reason);
                routes.closed = Some(reason);
            }
            for slot in routes.slots.values_mut() {
                slot.tx = None;
            }
            // Unattached routes keep their buffered events for a late waiter.
            routes.slots.retain(|_, slot| slot.rx.is_some());
        }
        lock(&self.approvals).clear();
        self.closed.send_replace(true);
    }

    fn close_error(&self, run_id: &str) -> BridgeError {
        let run_id = run_id.to_string();
        match lock(&self.routes).closed {
            Some(CloseReason::Cancelled) => BridgeError::Cancelled { run_id },
            _ => BridgeError::ProcessExited { run_id },
        }
    }
}

/// A waiter's handle on one correlation id. Removes the route when dropped.
struct Route {
    shared: Arc<Shared>,
    id: String,
    rx: mpsc::UnboundedReceiver<EventMsg>,
}

impl Route {
    async fn recv(&mut self) -> Option<EventMsg> {
        self.rx.recv().await
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        self.shared.remove_route(&self.id);
        // Nobody is left to answer for this run.
        lock(&self.shared.approvals).retain(|_, request| request.run_id != self.id);
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for value in frames.feed(&chunk[..n]) {
                    shared.handle_frame(value);
                }
            }
            Err(e) => {
                log::warn!("Read from session {} failed: {}", shared.session_id, e);
                break;
            }
        }
    }
    if let Some(value) = frames.flush() {
        shared.handle_frame(value);
    }
    if frames.dropped_lines() > 0 {
        log::debug!(
            "Session {} dropped {} non-JSON lines",
            shared.session_id,
            frames.dropped_lines()
        );
    }
    shared.close(CloseReason::ProcessExited);
}

async fn write_loop<W>(
    session_id: String,
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    transcript: Transcript,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        transcript.record(Direction::Stdin, &line);
        if let Err(e) = write_line(&mut writer, &line).await {
            log::warn!("Write to session {} failed: {}", session_id, e);
            break;
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    /// The other side of the pipes: reads our requests, writes events.
    struct FakeAgent {
        requests: Lines<BufReader<DuplexStream>>,
        stdout: Option<DuplexStream>,
    }

    impl FakeAgent {
        async fn next_request(&mut self) -> Value {
            let line = self.requests.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn emit(&mut self, id: &str, msg: Value) {
            let line = format!("{}\n", json!({"id": id, "msg": msg}));
            self.raw(line.as_bytes()).await;
        }

        async fn raw(&mut self, bytes: &[u8]) {
            let stdout = self.stdout.as_mut().unwrap();
            stdout.write_all(bytes).await.unwrap();
            stdout.flush().await.unwrap();
        }

        fn exit(&mut self) {
            self.stdout.take();
        }
    }

    fn connect(config: BridgeConfig) -> (ProtocolClient, FakeAgent) {
        let (client_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
        let (agent_stdout, client_stdout) = tokio::io::duplex(64 * 1024);
        let client = ProtocolClient::new(
            "session-1",
            client_stdin,
            client_stdout,
            config,
            Transcript::disabled(),
        );
        let agent = FakeAgent {
            requests: BufReader::new(agent_stdin).lines(),
            stdout: Some(agent_stdout),
        };
        (client, agent)
    }

    fn message(text: &str) -> Value {
        json!({"type": "agent_message", "message": text})
    }

    fn complete() -> Value {
        json!({"type": "task_complete"})
    }

    fn approval_request(call_id: &str) -> Value {
        json!({
            "type": "apply_patch_approval_request",
            "call_id": call_id,
            "changes": {"src/main.rs": {"update": {"unified_diff": "@@ -1 +1 @@"}}},
            "justification": "needed"
        })
    }

    mod send_input {
        use super::*;

        #[tokio::test]
        async fn writes_one_user_input_line() {
            let (client, mut agent) = connect(BridgeConfig::default());

            let run_id = client.send_input("hello", None).unwrap();
            let request = agent.next_request().await;

            assert_eq!(request["id"], json!(run_id));
            assert_eq!(request["op"]["type"], "user_input");
            assert_eq!(request["op"]["items"][0], json!({"type": "text", "text": "hello"}));
        }

        #[tokio::test]
        async fn honors_given_run_id() {
            let (client, mut agent) = connect(BridgeConfig::default());

            let run_id = client.send_input("hi", Some("run-42".to_string())).unwrap();
            assert_eq!(run_id, "run-42");
            assert_eq!(agent.next_request().await["id"], "run-42");
        }

        #[tokio::test]
        async fn generated_ids_are_unique() {
            let (client, _agent) = connect(BridgeConfig::default());
            let a = client.send_input("a", None).unwrap();
            let b = client.send_input("b", None).unwrap();
            assert_ne!(a, b);
        }

        #[tokio::test]
        async fn fails_after_process_exit() {
            let (client, mut agent) = connect(BridgeConfig::default());
            agent.exit();
            client.closed().await;

            let result = client.send_input("hello", None);
            assert!(matches!(result, Err(BridgeError::Write(_))));
            assert_eq!(client.active_runs(), 0);
        }
    }

    mod await_completion {
        use super::*;

        #[tokio::test]
        async fn joins_agent_messages_in_order() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("explain", None).unwrap();

            agent.emit(&run_id, json!({"type": "task_started"})).await;
            agent.emit(&run_id, message("first")).await;
            agent
                .emit(&run_id, json!({"type": "agent_message_delta", "delta": "sec"}))
                .await;
            agent.emit("other-run", message("not mine")).await;
            agent.emit(&run_id, message("second")).await;
            agent.emit(&run_id, complete()).await;

            let text = client.await_completion(&run_id, 0).await.unwrap();
            assert_eq!(text, "first\nsecond");
            assert_eq!(client.active_runs(), 0);
        }

        #[tokio::test]
        async fn events_before_await_are_buffered() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("hi", None).unwrap();

            agent.emit(&run_id, message("early")).await;
            agent.emit(&run_id, complete()).await;
            // Give the reader time to route everything before anyone waits.
            tokio::time::sleep(Duration::from_millis(20)).await;

            assert_eq!(client.await_completion(&run_id, 1_000).await.unwrap(), "early");
        }

        #[tokio::test]
        async fn events_split_across_chunks() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("hi", None).unwrap();

            let line = format!(
                "{}\n{}\n",
                json!({"id": run_id, "msg": message("split ✓")}),
                json!({"id": run_id, "msg": complete()})
            );
            let bytes = line.as_bytes();
            for piece in bytes.chunks(7) {
                agent.raw(piece).await;
            }

            assert_eq!(client.await_completion(&run_id, 0).await.unwrap(), "split ✓");
        }

        #[tokio::test(start_paused = true)]
        async fn error_event_is_protocol_error_not_timeout() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("hello", None).unwrap();
            agent.emit(&run_id, json!({"type": "error", "message": "bad key"})).await;

            match client.await_completion(&run_id, 1_000).await {
                Err(BridgeError::Protocol { correlation_id, message }) => {
                    assert_eq!(correlation_id, run_id);
                    assert_eq!(message, "bad key");
                }
                other => panic!("Expected Protocol error, got {other:?}"),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn silence_times_out() {
            let (client, _agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("hello", None).unwrap();

            let started = Instant::now();
            let result = client.await_completion(&run_id, 250).await;
            assert!(matches!(result, Err(BridgeError::Timeout { window_ms: 250, .. })));
            assert!(started.elapsed() >= Duration::from_millis(250));
            assert_eq!(client.active_runs(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn every_event_resets_the_clock() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("hello", None).unwrap();

            let waiter = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, 100).await })
            };

            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                agent.emit(&run_id, json!({"type": "exec_command_output_delta"})).await;
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
            agent.emit(&run_id, complete()).await;

            assert_eq!(waiter.await.unwrap().unwrap(), "");
        }

        #[tokio::test(start_paused = true)]
        async fn events_for_other_runs_do_not_reset_the_clock() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("hello", None).unwrap();

            let waiter = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, 100).await })
            };

            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                agent.emit("someone-else", message("noise")).await;
            }

            assert!(matches!(
                waiter.await.unwrap(),
                Err(BridgeError::Timeout { .. })
            ));
        }

        #[tokio::test(start_paused = true)]
        async fn non_positive_timeout_waits_forever() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("hello", None).unwrap();

            let waiter = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, -1).await })
            };

            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            assert!(!waiter.is_finished());

            agent.emit(&run_id, message("finally")).await;
            agent.emit(&run_id, complete()).await;
            assert_eq!(waiter.await.unwrap().unwrap(), "finally");
        }

        #[tokio::test]
        async fn second_waiter_is_rejected() {
            let (client, _agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("hello", None).unwrap();

            let first = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, 0).await })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;

            let second = client.await_completion(&run_id, 0).await;
            assert!(matches!(second, Err(BridgeError::AlreadyAwaited(id)) if id == run_id));
            first.abort();
        }

        #[tokio::test]
        async fn dropped_waiter_removes_route() {
            let (client, _agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("hello", None).unwrap();
            assert_eq!(client.active_runs(), 1);

            let result =
                tokio::time::timeout(Duration::from_millis(20), client.await_completion(&run_id, 0))
                    .await;
            assert!(result.is_err());
            assert_eq!(client.active_runs(), 0);
        }
    }

    mod approvals {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn approval_pause_never_times_out() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("edit the file", None).unwrap();

            let waiter = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, 100).await })
            };

            agent.emit(&run_id, approval_request("call-1")).await;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            assert!(!waiter.is_finished());

            let pending = client.pending_approvals();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].call_id, "call-1");
            assert_eq!(pending[0].run_id, run_id);

            agent.next_request().await; // user_input
            client
                .send_approval_decision(&ApprovalDecision::approve_once("call-1"))
                .unwrap();
            let decision = agent.next_request().await;
            assert_eq!(decision["op"]["type"], "exec_approval");
            assert_eq!(decision["op"]["call_id"], "call-1");
            assert_eq!(decision["op"]["decision"], "approve");
            assert_eq!(decision["op"]["scope"], "once");
            assert!(client.pending_approvals().is_empty());

            agent.emit(&run_id, message("patched")).await;
            agent.emit(&run_id, complete()).await;
            assert_eq!(waiter.await.unwrap().unwrap(), "patched");
        }

        #[tokio::test(start_paused = true)]
        async fn later_event_rearms_the_timer() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("edit", None).unwrap();

            let waiter = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, 100).await })
            };

            agent.emit(&run_id, approval_request("call-2")).await;
            tokio::time::sleep(Duration::from_secs(600)).await;
            assert!(!waiter.is_finished());

            agent.emit(&run_id, json!({"type": "patch_apply_begin"})).await;
            assert!(matches!(
                waiter.await.unwrap(),
                Err(BridgeError::Timeout { .. })
            ));
            assert!(client.pending_approvals().is_empty());
        }

        #[tokio::test]
        async fn dropped_waiter_clears_its_requests() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("edit", None).unwrap();
            agent.emit(&run_id, approval_request("call-4")).await;

            {
                let waiter = client.await_completion(&run_id, 0);
                tokio::pin!(waiter);
                assert!(
                    tokio::time::timeout(Duration::from_millis(50), &mut waiter)
                        .await
                        .is_err()
                );
                assert_eq!(client.pending_approvals().len(), 1);
            }
            assert!(client.pending_approvals().is_empty());
        }

        #[tokio::test]
        async fn terminal_event_clears_outstanding_requests() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("edit", None).unwrap();

            agent.emit(&run_id, approval_request("call-3")).await;
            agent.emit(&run_id, complete()).await;
            client.await_completion(&run_id, 0).await.unwrap();

            assert!(client.pending_approvals().is_empty());
        }

        #[tokio::test]
        async fn decision_with_path_scope() {
            let (client, mut agent) = connect(BridgeConfig::default());
            client
                .send_approval_decision(&ApprovalDecision::approve_path("call-4", "src/"))
                .unwrap();

            let decision = agent.next_request().await;
            assert_eq!(decision["op"]["scope"], "path");
            assert_eq!(decision["op"]["path"], "src/");
        }
    }

    mod configure {
        use super::*;

        #[tokio::test]
        async fn acknowledged() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);

            let pending = {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client
                        .configure("/work/repo", SessionOptions::default().model("o4-mini"))
                        .await
                })
            };

            let request = agent.next_request().await;
            assert_eq!(request["op"]["type"], "configure_session");
            assert_eq!(request["op"]["cwd"], "/work/repo");
            assert_eq!(request["op"]["model"], "o4-mini");

            let id = request["id"].as_str().unwrap().to_string();
            agent.emit("unrelated", json!({"type": "session_configured"})).await;
            agent.emit(&id, json!({"type": "session_configured", "model": "o4-mini"})).await;

            assert_eq!(pending.await.unwrap().unwrap(), ConfigureOutcome::Acknowledged);
            assert!(client.is_configured());
        }

        #[tokio::test]
        async fn missing_ack_resolves_after_grace() {
            let config = BridgeConfig {
                configure_grace_ms: 50,
                ..BridgeConfig::default()
            };
            let (client, _agent) = connect(config);

            let outcome = client.configure("/repo", SessionOptions::default()).await;
            assert_eq!(outcome.unwrap(), ConfigureOutcome::AssumedAfterGrace);
            assert!(client.is_configured());
        }

        #[tokio::test]
        async fn error_rejects() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);

            let pending = {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.configure("/repo", SessionOptions::default()).await })
            };

            let id = agent.next_request().await["id"].as_str().unwrap().to_string();
            agent.emit(&id, json!({"type": "error", "message": "unknown model"})).await;

            assert!(matches!(
                pending.await.unwrap(),
                Err(BridgeError::Protocol { message, .. }) if message == "unknown model"
            ));
            assert!(!client.is_configured());
        }
    }

    mod teardown {
        use super::*;

        #[tokio::test]
        async fn exit_rejects_pending_turn() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("hello", None).unwrap();

            let waiter = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, 0).await })
            };
            agent.emit(&run_id, message("partial")).await;
            agent.exit();

            assert!(matches!(
                waiter.await.unwrap(),
                Err(BridgeError::ProcessExited { run_id: id }) if id == run_id
            ));
            assert!(client.is_closed());
        }

        #[tokio::test]
        async fn completion_buffered_before_exit_still_resolves() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let run_id = client.send_input("hello", None).unwrap();

            agent.emit(&run_id, message("done already")).await;
            agent.emit(&run_id, complete()).await;
            agent.exit();
            client.closed().await;

            assert_eq!(
                client.await_completion(&run_id, 0).await.unwrap(),
                "done already"
            );
        }

        #[tokio::test]
        async fn cancel_rejects_with_cancelled() {
            let (client, _agent) = connect(BridgeConfig::default());
            let client = Arc::new(client);
            let run_id = client.send_input("hello", None).unwrap();

            let waiter = {
                let client = Arc::clone(&client);
                let run_id = run_id.clone();
                tokio::spawn(async move { client.await_completion(&run_id, 0).await })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.cancel();

            assert!(matches!(
                waiter.await.unwrap(),
                Err(BridgeError::Cancelled { .. })
            ));
            assert!(matches!(
                client.send_input("again", None),
                Err(BridgeError::Write(_))
            ));
        }

        #[tokio::test]
        async fn await_after_exit_fails_immediately() {
            let (client, mut agent) = connect(BridgeConfig::default());
            agent.exit();
            client.closed().await;

            assert!(matches!(
                client.await_completion("never-sent", 0).await,
                Err(BridgeError::ProcessExited { .. })
            ));
        }
    }

    mod subscription {
        use super::*;

        #[tokio::test]
        async fn sees_every_event_in_order() {
            let (client, mut agent) = connect(BridgeConfig::default());
            let mut events = client.subscribe();

            agent.raw(b"not json at all\n").await;
            agent.emit("a", json!({"type": "task_started"})).await;
            agent.emit("b", approval_request("call-5")).await;
            agent.emit("a", complete()).await;

            let first = events.recv().await.unwrap();
            assert_eq!(first.correlation_id(), "a");
            assert_eq!(first.msg, EventMsg::Unknown);
            assert_eq!(first.raw.event_type, "task_started");

            let second = events.recv().await.unwrap();
            assert!(matches!(
                second.msg,
                EventMsg::ApplyPatchApprovalRequest { ref changes, .. }
                    if changes.keys().collect::<Vec<_>>() == vec!["src/main.rs"]
            ));

            let third = events.recv().await.unwrap();
            assert!(third.msg.is_terminal());
        }
    }
}
