//! Cairn evaluation source - the bridge between an executing user program
//! and the deployment engine that plans its resources.
//!
//! A user program runs inside an external language runtime. As it declares
//! resources it calls back into this crate's resource monitor, and each
//! call is held in rendezvous with the engine: registration waits for the
//! engine to assign a URN, completion waits for the engine to compute
//! final state. The key pieces are:
//!
//! ## Evaluation
//!
//! - [`EvalSource`]: one program evaluation against one target stack
//! - [`SourceIterator`]: the engine-facing pull interface over the run's
//!   resource events
//! - [`Monitor`]: the loopback gRPC server presented to the language
//!   runtime
//!
//! ## Data model
//!
//! - [`Goal`] / [`FinalState`]: desired and post-step resource state
//! - [`PropertyValue`]: the property codec, including unknown-value
//!   sentinels and asset digests
//!
//! ## Plugin seam
//!
//! - [`Host`], [`LanguagePlugin`], [`Provider`]: the interface this crate
//!   requires of the plugin host

pub mod messages;
pub mod monitor;
pub mod plugin;
pub mod property;
pub mod resource;
pub mod source;
pub mod source_eval;
pub mod tokens;

// Wire types
pub use messages::proto;

// Monitor
pub use monitor::Monitor;

// Plugin seam
pub use plugin::{
    CheckFailure, Host, InvokeOutcome, LanguagePlugin, LanguageRunArgs, PluginContext, Provider,
};

// Property codec
pub use property::{
    marshal_properties, unmarshal_properties, Asset, AssetSource, MarshalOptions, PropertyError,
    PropertyMap, PropertyValue, UNKNOWN_PROPERTY_VALUE,
};

// Resource state
pub use resource::{FinalState, Goal, ResourceState};

// Source interface and events
pub use source::{
    BeginRegisterEvent, EndRegisterEvent, Options, Source, SourceError, SourceEvent,
    SourceIterator,
};

// Evaluation source
pub use source_eval::{EvalSource, EvalSourceIterator, PackageDescriptor, RunInfo, Target};

// Tokens
pub use tokens::{FunctionToken, PackageName, ResourceType, Urn};
