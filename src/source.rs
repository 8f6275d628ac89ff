//! Engine-facing interfaces: the event source abstraction and the events it
//! yields.
//!
//! A [`Source`] produces a fresh [`SourceIterator`] per run; the engine
//! pulls [`SourceEvent`]s from it and acknowledges each one by calling
//! `done(...)` with its reply. The RPC that produced the event stays parked
//! until that reply lands, which is what holds the user program in lockstep
//! with the engine.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::property::PropertyMap;
use crate::resource::{FinalState, Goal};
use crate::tokens::{PackageName, Urn};

/// Per-iteration options supplied by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Advisory concurrency hint, forwarded verbatim to the language
    /// runtime.
    pub parallel: usize,
}

/// A source of resource events for one program evaluation.
#[async_trait]
pub trait Source: Send + Sync {
    /// Release the source. The plugin host is owned and closed by the
    /// caller.
    async fn close(&self) -> Result<(), SourceError>;

    /// The package being evaluated.
    fn pkg(&self) -> PackageName;

    /// A diagnostic snapshot of the run descriptor.
    fn info(&self) -> serde_json::Value;

    /// Begin a run, returning the iterator the engine will pull from.
    async fn iterate(&self, opts: Options) -> Result<Box<dyn SourceIterator>, SourceError>;
}

/// The engine-facing pull interface over one run's event stream.
#[async_trait]
pub trait SourceIterator: Send {
    /// Block for the next event. `Ok(None)` is the terminal end-of-stream;
    /// a program failure surfaces once as `Err` and then the stream ends.
    async fn next(&mut self) -> Result<Option<SourceEvent>, SourceError>;

    /// Tear down the monitor and release the port.
    async fn close(&mut self) -> Result<(), SourceError>;
}

/// A unit of work flowing from the resource monitor to the engine. The
/// engine must complete every event it receives; an unacknowledged event
/// leaves the user program parked forever.
#[derive(Debug)]
pub enum SourceEvent {
    BeginRegister(BeginRegisterEvent),
    EndRegister(EndRegisterEvent),
}

/// A resource declaration awaiting its URN.
#[derive(Debug)]
pub struct BeginRegisterEvent {
    goal: Goal,
    reply: oneshot::Sender<Urn>,
}

impl BeginRegisterEvent {
    pub(crate) fn new(goal: Goal) -> (Self, oneshot::Receiver<Urn>) {
        let (reply, rx) = oneshot::channel();
        (Self { goal, reply }, rx)
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    /// Deliver the engine-assigned URN, unblocking the registration RPC.
    /// Consumes the event, so an event can only ever be completed once.
    pub fn done(self, urn: Urn) {
        if self.reply.send(urn).is_err() {
            // The RPC was cancelled out from under us; the program is gone.
            debug!(ty = %self.goal.ty(), name = self.goal.name(), "registration reply dropped");
        }
    }
}

/// A resource completion awaiting its final state.
#[derive(Debug)]
pub struct EndRegisterEvent {
    urn: Urn,
    extras: PropertyMap,
    reply: oneshot::Sender<FinalState>,
}

impl EndRegisterEvent {
    pub(crate) fn new(urn: Urn, extras: PropertyMap) -> (Self, oneshot::Receiver<FinalState>) {
        let (reply, rx) = oneshot::channel();
        (Self { urn, extras, reply }, rx)
    }

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Extra output properties reported by the program.
    pub fn extras(&self) -> &PropertyMap {
        &self.extras
    }

    /// Deliver the final state, unblocking the completion RPC. Consumes the
    /// event, so an event can only ever be completed once.
    pub fn done(self, state: FinalState) {
        if self.reply.send(state).is_err() {
            debug!(urn = %self.urn, "completion reply dropped");
        }
    }
}

/// Errors surfaced by the evaluation source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to start resource monitor")]
    MonitorStart(#[source] std::io::Error),
    #[error("resource monitor server failed")]
    MonitorServe(#[source] tonic::transport::Error),
    #[error("resource monitor task panicked")]
    MonitorPanic(#[source] tokio::task::JoinError),
    #[error("failed to launch language host for '{runtime}': {cause}")]
    LanguageLaunch { runtime: String, cause: String },
    #[error("could not load language plugin for '{runtime}'")]
    LanguageMissing { runtime: String },
    #[error("program run failed: {0}")]
    ProgramRun(String),
    #[error("an unhandled error occurred: {0}")]
    ProgramUnhandled(String),
}
