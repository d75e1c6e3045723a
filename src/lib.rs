//! haul is a download engine for fetching large binary artifacts (model
//! weights, checkpoints, tensors) from repository and registry sources with
//! parallel ranged transfer, resume, and verified atomic publish.
//!
//! [`Engine`] is the entry point: construct it with [`EngineConfig`], call
//! [`Engine::recover_on_start`] once, then [`Engine::start`] per download and
//! observe [`Engine::subscribe`] for progress.

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod fileio;
pub mod format;
pub mod hash;
pub mod http;
pub mod plan;
pub mod probe;
pub mod progress;
pub mod repair;
pub mod resolver;
pub mod stage;
pub mod state;
pub mod tokio_rt;
pub mod workers;

mod path;

pub use config::Config;
pub use engine::{Engine, EngineConfig, Handle};
pub use error::{Error, ErrorKind, Result};
pub use progress::{ProgressEvent, ProgressReceiver};
pub use state::{ChunkRow, ChunkStatus, DownloadFilter, DownloadRow, DownloadStatus, Key, StateStore};
