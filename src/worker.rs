//! Per-container stream worker.
//!
//! One worker owns one container's log connection, from `Connecting`
//! through `Streaming`, bounded `Backoff` cycles, `Draining`, and
//! `Terminated`. Failures stay inside the worker: a broken or malicious
//! stream costs one container's logs, never the engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::watch;

use crate::config::Settings;
use crate::container::{ContainerRecord, ContainerStatus};
use crate::demux::{FrameDecoder, LineAssembler, StreamKind};
use crate::docker::{self, ContainerRuntime, LogStart, LogStream};
use crate::enrich::Enricher;
use crate::forward::ForwarderHandle;
use crate::policy::BackoffPolicy;
use crate::registry::{StreamRegistry, WorkerCommand};

/// Worker tunables, copied out of [`Settings`] at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    pub drain_grace: Duration,
    pub failure_reset_after: Duration,
    pub backoff: BackoffPolicy,
}

impl From<&Settings> for WorkerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            stall_timeout: settings.stall_timeout,
            drain_grace: settings.drain_grace,
            failure_reset_after: settings.failure_reset_after,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// History window requested for a container that is already stopped when
/// its worker starts. Everything such a container will ever log lies in
/// the past, so `tail=0` would stream nothing.
const STOPPED_BACKFILL_LINES: u32 = 100;

/// Mutable per-connection state, owned exclusively by the worker.
#[derive(Debug, Default)]
struct StreamState {
    cursor: Option<docker::LogCursor>,
    consecutive_failures: u32,
}

/// How one streaming attempt ended.
enum StreamEnd {
    /// Stop command or forwarder shutdown; go straight to draining.
    Stopped,
    /// The runtime no longer knows the container; drain and terminate.
    ContainerGone,
    /// Transient failure; back off and reconnect.
    Failed,
}

pub struct StreamWorker {
    container: ContainerRecord,
    runtime: Arc<dyn ContainerRuntime>,
    forwarder: ForwarderHandle,
    registry: Arc<StreamRegistry>,
    epoch: u64,
    commands: watch::Receiver<WorkerCommand>,
    config: WorkerConfig,
}

impl StreamWorker {
    /// Registers a slot for the container and spawns its worker task.
    ///
    /// Returns `false` without side effects when a worker for this id is
    /// already registered, making duplicate start events idempotent.
    pub fn spawn(
        container: ContainerRecord,
        runtime: Arc<dyn ContainerRuntime>,
        forwarder: ForwarderHandle,
        registry: Arc<StreamRegistry>,
        config: WorkerConfig,
    ) -> bool {
        let Some(slot) = registry.try_register(container.id().clone()) else {
            return false;
        };
        let worker = Self {
            container,
            runtime,
            forwarder,
            registry,
            epoch: slot.epoch,
            commands: slot.commands,
            config,
        };
        tokio::spawn(worker.run());
        true
    }

    async fn run(mut self) {
        log::info!(
            "starting log stream for container `{}` ({})",
            self.container.name(),
            self.container.id().short()
        );

        let mut enricher = Enricher::new(&self.container);
        let mut state = StreamState::default();
        // Complete lines decoded but not yet accepted by the forwarder;
        // whatever is left here when the worker stops is drained.
        let mut lines: Vec<(StreamKind, String)> = Vec::new();

        loop {
            // Connecting
            let start = match state.cursor {
                Some(cursor) => LogStart::Since(cursor),
                None if self.container.status() == ContainerStatus::Stopped => {
                    LogStart::Tail(STOPPED_BACKFILL_LINES)
                }
                None => LogStart::New,
            };
            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                self.runtime
                    .open_log_stream(self.container.id(), start, self.container.tty()),
            );
            let mut commands = self.commands.clone();
            let stream = tokio::select! {
                _ = stop_signal(&mut commands) => break,
                connected = connect => match connected {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(docker::Error::NotFound(_))) => break,
                    Ok(Err(err)) => {
                        state.consecutive_failures += 1;
                        log::warn!(
                            "failed to open log stream for `{}`: {}",
                            self.container.name(),
                            err
                        );
                        if !self.backoff(&state).await {
                            break;
                        }
                        continue;
                    }
                    Err(_) => {
                        state.consecutive_failures += 1;
                        log::warn!(
                            "log stream connection for `{}` timed out",
                            self.container.name()
                        );
                        if !self.backoff(&state).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            // Streaming
            match self
                .stream_frames(stream, &mut enricher, &mut state, &mut lines)
                .await
            {
                StreamEnd::Stopped | StreamEnd::ContainerGone => break,
                StreamEnd::Failed => {
                    if !self.backoff(&state).await {
                        break;
                    }
                }
            }
        }

        // Draining
        self.drain(&mut enricher, lines).await;

        // Terminated
        self.registry
            .deregister(self.container.id().as_ref(), self.epoch);
        log::info!(
            "log stream ended for container `{}` ({})",
            self.container.name(),
            self.container.id().short()
        );
    }

    /// Reads one connection until it ends. Decoded complete lines are
    /// enriched and handed to the forwarder immediately; at most the lines
    /// of the last chunk remain in `lines` when this returns.
    async fn stream_frames(
        &mut self,
        stream: LogStream,
        enricher: &mut Enricher,
        state: &mut StreamState,
        lines: &mut Vec<(StreamKind, String)>,
    ) -> StreamEnd {
        let mut decoder = if stream.multiplexed {
            FrameDecoder::multiplexed()
        } else {
            FrameDecoder::raw()
        };
        // A fresh assembler per connection: a partial line from a broken
        // stream must not be glued onto unrelated output after reconnect.
        let mut assembler = LineAssembler::new();
        let mut bytes = stream.bytes;
        let connected_at = Instant::now();
        let mut commands = self.commands.clone();

        loop {
            let chunk = tokio::select! {
                _ = stop_signal(&mut commands) => return StreamEnd::Stopped,
                read = tokio::time::timeout(self.config.stall_timeout, bytes.next()) => read,
            };

            let chunk = match chunk {
                // Quiet stream. Not a failure by itself, but if the
                // container is gone the follow connection may never end.
                Err(_) => match self.probe_running().await {
                    Some(true) => continue,
                    Some(false) => return StreamEnd::ContainerGone,
                    None => continue,
                },
                Ok(None) => {
                    // EOF: the runtime ends a follow stream when the
                    // container stops.
                    return match self.probe_running().await {
                        Some(true) => {
                            state.consecutive_failures += 1;
                            log::warn!(
                                "log stream for running container `{}` closed unexpectedly",
                                self.container.name()
                            );
                            StreamEnd::Failed
                        }
                        _ => StreamEnd::ContainerGone,
                    };
                }
                Ok(Some(Err(err))) => {
                    state.consecutive_failures += 1;
                    log::warn!(
                        "read error on log stream for `{}`: {}",
                        self.container.name(),
                        err
                    );
                    return StreamEnd::Failed;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            state.cursor = Some(docker::LogCursor::now());
            decoder.extend(&chunk);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => assembler.push(&frame, lines),
                    Ok(None) => break,
                    Err(err) => {
                        state.consecutive_failures += 1;
                        log::error!(
                            "corrupt log stream for `{}`: {}",
                            self.container.name(),
                            err
                        );
                        return StreamEnd::Failed;
                    }
                }
            }

            for (kind, line) in lines.drain(..) {
                let record = enricher.enrich(kind, &line);
                if !self.forwarder.send(record).await {
                    return StreamEnd::Stopped;
                }
            }

            if state.consecutive_failures > 0
                && connected_at.elapsed() >= self.config.failure_reset_after
            {
                state.consecutive_failures = 0;
            }
        }
    }

    /// Best-effort flush of leftover lines within the drain grace period.
    async fn drain(&mut self, enricher: &mut Enricher, lines: Vec<(StreamKind, String)>) {
        if lines.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.config.drain_grace;
        for (kind, line) in lines {
            let record = enricher.enrich(kind, &line);
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.forwarder.send(record)).await {
                Ok(_) => {}
                Err(_) => {
                    log::warn!(
                        "drain grace expired for container `{}`",
                        self.container.name()
                    );
                    return;
                }
            }
        }
    }

    /// Waits out the backoff delay; `false` means a stop arrived meanwhile.
    async fn backoff(&mut self, state: &StreamState) -> bool {
        let attempt = state.consecutive_failures.saturating_sub(1);
        let delay = self.config.backoff.delay(attempt);
        log::debug!(
            "backing off {}ms before reconnecting to `{}` (failure #{})",
            delay.as_millis(),
            self.container.name(),
            state.consecutive_failures
        );
        let mut commands = self.commands.clone();
        tokio::select! {
            _ = stop_signal(&mut commands) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Asks the runtime whether the container still runs; `None` when the
    /// probe itself failed (treated as inconclusive, not as gone).
    async fn probe_running(&self) -> Option<bool> {
        match self.runtime.inspect(self.container.id()).await {
            Ok(Some(record)) => Some(record.status() == ContainerStatus::Running),
            Ok(None) => Some(false),
            Err(err) => {
                log::debug!(
                    "runtime probe for `{}` failed: {}",
                    self.container.name(),
                    err
                );
                None
            }
        }
    }
}

/// Resolves once the worker has been told to stop. A closed command
/// channel (the registry entry was evicted) counts as a stop.
async fn stop_signal(commands: &mut watch::Receiver<WorkerCommand>) {
    loop {
        if *commands.borrow_and_update() == WorkerCommand::Stop {
            return;
        }
        if commands.changed().await.is_err() {
            return;
        }
    }
}
