//! The evaluation source: runs a user program under its language runtime
//! and surfaces the resources it declares as a pull-driven event stream.
//!
//! One [`EvalSource`] covers one program against one target stack. Each
//! [`EvalSource::iterate`] call stands up a fresh resource monitor, spawns
//! the program driver task, and hands back an iterator the engine drains
//! with [`SourceIterator::next`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::monitor::Monitor;
use crate::plugin::{Host, LanguageRunArgs, PluginContext};
use crate::source::{
    BeginRegisterEvent, EndRegisterEvent, Options, Source, SourceError, SourceEvent,
    SourceIterator,
};
use crate::tokens::PackageName;

/// Immutable descriptor of one program evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    /// The package being evaluated.
    pub pkg: PackageDescriptor,
    /// The package's working directory.
    pub pwd: PathBuf,
    /// The path to the program to execute.
    pub program: PathBuf,
    /// Arguments to pass to the program.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// The target being deployed into.
    pub target: Target,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: PackageName,
    /// Tag naming the language runtime that hosts this package's programs.
    pub runtime: String,
}

/// The stack being deployed into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// A planning source that evaluates a program to discover desired resource
/// state.
///
/// With `destroy` set, initialization still happens but no program runs and
/// the stream is empty, which the engine reads as "remove everything".
/// `dry_run` is forwarded to the language runtime so the program avoids
/// irreversible operations.
pub struct EvalSource {
    plugctx: Arc<PluginContext>,
    runinfo: Arc<RunInfo>,
    destroy: bool,
    dry_run: bool,
}

impl EvalSource {
    pub fn new(plugctx: Arc<PluginContext>, runinfo: RunInfo, destroy: bool, dry_run: bool) -> Self {
        Self {
            plugctx,
            runinfo: Arc::new(runinfo),
            destroy,
            dry_run,
        }
    }

    /// Spawn the program driver. It resolves the language runtime, runs the
    /// program against the monitor, and reports the outcome on the finish
    /// channel exactly once.
    fn fork_run(&self, monitor_addr: String, fin_tx: mpsc::Sender<Option<SourceError>>, opts: Options) {
        let host = Arc::clone(&self.plugctx.host);
        let runinfo = Arc::clone(&self.runinfo);
        let dry_run = self.dry_run;
        tokio::spawn(async move {
            let result = run_program(host, runinfo, monitor_addr, dry_run, opts).await;
            // The finish channel is buffered, so the send completes even if
            // the iterator has already shut down.
            let _ = fin_tx.send(result.err()).await;
        });
    }
}

#[async_trait]
impl Source for EvalSource {
    async fn close(&self) -> Result<(), SourceError> {
        // The plugin host is owned and closed by the caller.
        Ok(())
    }

    fn pkg(&self) -> PackageName {
        self.runinfo.pkg.name.clone()
    }

    fn info(&self) -> serde_json::Value {
        serde_json::to_value(self.runinfo.as_ref()).unwrap_or_default()
    }

    async fn iterate(&self, opts: Options) -> Result<Box<dyn SourceIterator>, SourceError> {
        // Size-one channels: FIFO delivery keeps events in RPC arrival
        // order, and dropping a receiver unblocks any send parked during
        // teardown.
        let (begin_tx, begin_rx) = mpsc::channel(1);
        let (end_tx, end_rx) = mpsc::channel(1);
        let (fin_tx, fin_rx) = mpsc::channel(1);

        let monitor = Monitor::start(Arc::clone(&self.plugctx.host), begin_tx, end_tx).await?;

        if !self.destroy {
            self.fork_run(monitor.address(), fin_tx, opts);
        }

        Ok(Box::new(EvalSourceIterator {
            monitor,
            destroy: self.destroy,
            begin_rx,
            end_rx,
            fin_rx,
            done: false,
        }))
    }
}

/// The engine-facing iterator over one run's event stream.
pub struct EvalSourceIterator {
    monitor: Monitor,
    destroy: bool,
    begin_rx: mpsc::Receiver<BeginRegisterEvent>,
    end_rx: mpsc::Receiver<EndRegisterEvent>,
    fin_rx: mpsc::Receiver<Option<SourceError>>,
    done: bool,
}

#[async_trait]
impl SourceIterator for EvalSourceIterator {
    async fn next(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        if self.done {
            return Ok(None);
        }

        // Destroy runs produce no events at all.
        if self.destroy {
            return Ok(None);
        }

        tokio::select! {
            Some(event) = self.begin_rx.recv() => {
                let goal = event.goal();
                debug!(
                    ty = %goal.ty(),
                    name = goal.name(),
                    props = goal.properties().len(),
                    "iterator produced a registration"
                );
                Ok(Some(SourceEvent::BeginRegister(event)))
            }
            Some(event) = self.end_rx.recv() => {
                debug!(
                    urn = %event.urn(),
                    extras = event.extras().len(),
                    "iterator produced a completion"
                );
                Ok(Some(SourceEvent::EndRegister(event)))
            }
            finish = self.fin_rx.recv() => {
                // The language runtime has exited; no further events can
                // arrive.
                self.done = true;
                match finish.flatten() {
                    Some(err) => {
                        debug!(error = %err, "evaluation ended with an error");
                        Err(err)
                    }
                    None => Ok(None),
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.monitor.cancel().await
    }
}

async fn run_program(
    host: Arc<dyn Host>,
    runinfo: Arc<RunInfo>,
    monitor_addr: String,
    dry_run: bool,
    opts: Options,
) -> Result<(), SourceError> {
    let runtime = &runinfo.pkg.runtime;
    let langhost = host
        .language_runtime(runtime, &monitor_addr)
        .await
        .map_err(|err| SourceError::LanguageLaunch {
            runtime: runtime.clone(),
            cause: format!("{err:#}"),
        })?
        .ok_or_else(|| SourceError::LanguageMissing {
            runtime: runtime.clone(),
        })?;

    let run = langhost
        .run(LanguageRunArgs {
            stack: runinfo.target.name.clone(),
            project: runinfo.pkg.name.to_string(),
            pwd: runinfo.pwd.clone(),
            program: runinfo.program.clone(),
            args: runinfo.args.clone(),
            config: runinfo.target.config.clone(),
            dry_run,
            parallel: opts.parallel,
        })
        .await;

    // Release the runtime handle on every exit path before inspecting the
    // run result.
    if let Err(err) = langhost.close().await {
        warn!(?err, runtime = %runtime, "failed to close language plugin");
    }

    match run {
        Err(err) => Err(SourceError::ProgramRun(format!("{err:#}"))),
        Ok(Some(message)) => Err(SourceError::ProgramUnhandled(message)),
        Ok(None) => Ok(()),
    }
}
