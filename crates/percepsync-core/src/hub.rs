use crate::{
    config::Config,
    heartbeat::Liveness,
    lifecycle::{Lifecycle, LifecycleState, TeardownReason},
    registry::{Process, Registry},
    rendezvous::RendezvousEvent,
    session::{Session, SessionError, check_version},
    source::SourceConnector,
    speech::Transcriber,
};
use eyre::Result;
use itertools::Itertools;
use std::sync::Arc;
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The synchronization hub.
///
/// Waits for the target capture process to appear, runs one session
/// against it, and tears the session down when the process goes away.
/// Sessions are rebuilt for as long as the hub runs.
pub struct Hub<C> {
    config: Config,
    registry: Arc<Registry>,
    connector: C,
    transcriber: Option<Arc<dyn Transcriber>>,
    lifecycle: Lifecycle,
    session: Option<Session>,
}

impl<C> Hub<C>
where
    C: SourceConnector,
{
    /// Creates a hub. `registry` is the directory the rendezvous server
    /// serves, in which the hub advertises itself.
    pub fn new(config: Config, registry: Arc<Registry>, connector: C) -> Self {
        Self {
            config,
            registry,
            connector,
            transcriber: None,
            lifecycle: Lifecycle::new(),
            session: None,
        }
    }

    /// Enables transcripts in the perceptions.
    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Lifecycle transitions, as they happen.
    pub fn status(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Reacts to one rendezvous event.
    ///
    /// Fails when a session for the target could not be constructed. The
    /// hub keeps waiting for the next announcement in that case.
    pub async fn handle(&mut self, event: RendezvousEvent) -> Result<(), SessionError> {
        match event {
            RendezvousEvent::ProcessAdded(process) => {
                report(&process);
                if process.name == self.config.target.process {
                    self.start_session(process).await?;
                }
            }
            RendezvousEvent::ProcessRemoved(process) => {
                info!(process = %process.name, "Process removed");
                let is_target = self
                    .session
                    .as_ref()
                    .is_some_and(|session| session.process().name == process.name);
                if is_target {
                    self.tear_down(TeardownReason::ProcessRemoved).await;
                }
            }
            RendezvousEvent::Error(err) => {
                warn!(error = %err, "Rendezvous error");
                if err.is_fatal() {
                    self.tear_down(TeardownReason::ProtocolError).await;
                }
            }
        }
        Ok(())
    }

    async fn start_session(&mut self, process: Process) -> Result<(), SessionError> {
        if self.session.is_some() {
            warn!(process = %process.name, "A session is already running, announcement ignored");
            return Ok(());
        }
        self.lifecycle.reset();

        if let Err(err) = check_version(&self.config.target, &process) {
            error!(error = %err, "Refusing the target process");
            return Err(err);
        }

        self.lifecycle.begin_connecting();
        let result = Session::start(
            process,
            &self.config,
            &self.connector,
            self.transcriber.clone(),
        )
        .await;

        match result {
            Ok(session) => {
                self.session = Some(session);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Unable to start a session");
                self.lifecycle.tear_down(TeardownReason::ConstructionFailed);
                self.lifecycle.reset();
                Err(err)
            }
        }
    }

    /// Samples the session's liveness and applies the resulting
    /// lifecycle transition.
    pub fn check_liveness(&mut self) -> Option<Liveness> {
        let session = self.session.as_mut()?;
        let liveness = session.refresh();

        match self.lifecycle.observe_liveness(liveness) {
            Some(LifecycleState::Active) => {
                session.set_stale(false);
                session.advertise(&self.registry);
            }
            Some(LifecycleState::Degraded) => session.set_stale(true),
            _ => {}
        }
        Some(liveness)
    }

    /// Tears the running session down, if any, and returns to waiting.
    /// Repeated calls are harmless.
    pub async fn tear_down(&mut self, reason: TeardownReason) {
        if !self.lifecycle.tear_down(reason) {
            return;
        }
        if let Some(session) = self.session.take() {
            session.teardown(&self.registry).await;
        }
        self.lifecycle.reset();
    }

    /// Processes rendezvous events until `shutdown` fires or the event
    /// channel closes.
    pub async fn run(
        mut self,
        events: flume::Receiver<RendezvousEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.heartbeat.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(process = %self.config.target.process, "Waiting for the capture process");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv_async() => match event {
                    Ok(event) => {
                        // Failures are logged and the hub keeps waiting.
                        let _ = self.handle(event).await;
                    }
                    Err(_) => {
                        warn!("Rendezvous event channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.check_liveness();
                }
            }
        }

        self.tear_down(TeardownReason::Shutdown).await;
        info!("Hub stopped");
        Ok(())
    }
}

/// Logs a process with every endpoint and stream it exposes.
fn report(process: &Process) {
    let streams = process
        .endpoints
        .iter()
        .flat_map(|endpoint| endpoint.streams())
        .map(|stream| format!("{}:{}", stream.name, stream.short_type()))
        .join(", ");
    info!(
        process = %process.name,
        version = process.version.as_deref().unwrap_or("-"),
        streams = %streams,
        "Process added"
    );
    for endpoint in &process.endpoints {
        info!(process = %process.name, endpoint = %endpoint, "Endpoint");
    }
}
