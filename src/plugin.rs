//! The interface this crate requires of the plugin host.
//!
//! The host owns subprocess lifecycle for language runtimes and resource
//! providers; the evaluation source only ever sees these traits. Lookups
//! return `Ok(None)` when no plugin could be located, mirroring the
//! distinction between "lookup failed" and "nothing found".

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::property::PropertyMap;
use crate::tokens::{FunctionToken, PackageName};

/// Shared plugin state for one engine invocation.
pub struct PluginContext {
    pub host: Arc<dyn Host>,
}

impl PluginContext {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }
}

/// Locates and launches plugins. Implemented outside this crate.
#[async_trait]
pub trait Host: Send + Sync {
    /// Launch (or attach to) the language runtime for `runtime`, handing it
    /// the resource monitor's listening address.
    async fn language_runtime(
        &self,
        runtime: &str,
        monitor_addr: &str,
    ) -> Result<Option<Arc<dyn LanguagePlugin>>>;

    /// Load the resource provider for `package`.
    async fn provider(&self, package: &PackageName) -> Result<Option<Arc<dyn Provider>>>;
}

/// A handle on a running language runtime.
#[async_trait]
pub trait LanguagePlugin: Send + Sync {
    /// Execute the user program to completion. `Ok(Some(text))` reports an
    /// unhandled error inside the program; `Ok(None)` is a clean exit.
    async fn run(&self, args: LanguageRunArgs) -> Result<Option<String>>;

    /// Release the runtime handle.
    async fn close(&self) -> Result<()>;
}

/// Everything the language runtime needs to execute one program.
#[derive(Debug, Clone)]
pub struct LanguageRunArgs {
    pub stack: String,
    pub project: String,
    pub pwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub config: BTreeMap<String, String>,
    pub dry_run: bool,
    pub parallel: usize,
}

/// A provider plugin offering invoke operations for a package's tokens.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn invoke(&self, tok: &FunctionToken, args: PropertyMap) -> Result<InvokeOutcome>;
}

/// The result of a provider invoke: a return map plus any per-property
/// input validation failures. Failures are structured feedback, not errors.
#[derive(Debug, Clone, Default)]
pub struct InvokeOutcome {
    pub returns: PropertyMap,
    pub failures: Vec<CheckFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub property: String,
    pub reason: String,
}
