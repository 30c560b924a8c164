//! klp-core: livepatch build orchestration engine
//!
//! Re-exports the engine components used by the `klp-build` binary.
//!
//! ## Key Components
//!
//! - `Registry`: codestream to build-service project mapping and filtering
//! - `Dispatcher`: bounded concurrent batch execution with per-task reports
//! - `DownloadPipeline`: idempotent kernel and livepatch RPM retrieval
//! - `StatusPoller`: build result polling until every project is terminal
//! - `SymbolValidator`: livepatch module dependency checks
//! - `Publisher`: sequential project creation, push, cleanup and logs
//! - `TestBundler`: per-architecture test archives

pub mod bundle;
pub mod codestream;
pub mod dispatcher;
pub mod error;
pub mod fakes;
pub mod git;
pub mod layout;
pub mod pipeline;
pub mod poller;
pub mod publisher;
pub mod registry;
pub mod settings;
pub mod telemetry;
pub mod tools;
pub mod validator;

pub use bundle::TestBundler;
pub use codestream::{
    Codestream, CodestreamData, CodestreamMap, CodestreamTuple, KernelFlavor, PackageNames,
    RepoChannel, ARCHS, PRIMARY_ARCH,
};
pub use dispatcher::{BatchReport, Dispatcher, Progress, Task, TaskFailure, TaskOutcome};
pub use error::{KlpError, Result};
pub use git::Identity;
pub use layout::Layout;
pub use pipeline::{DownloadPipeline, PipelineReport, WorkItem};
pub use poller::{BuildStatus, PollState, ProjectStatus, Sleeper, StatusPoller, TokioSleeper};
pub use publisher::Publisher;
pub use registry::{CodestreamFilter, Registry};
pub use settings::{Settings, SettingsInput};
pub use telemetry::init_tracing;
pub use tools::{ArchiveTools, SystemTools};
pub use validator::{
    missing_symbols, BinaryInspector, DependencyWarning, LivepatchModule, NmInspector,
    SymbolValidator,
};
