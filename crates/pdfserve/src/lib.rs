//! pdfserve: receive text documents over TCP and send back PDFs.

pub mod artifacts;
pub mod config;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod supervisor;
pub mod wire;
pub mod worker;

pub use artifacts::ArtifactSet;
pub use config::{CliArgs, ServerConfig, prompt_port};
pub use pipeline::{
    ConvertedDocument, ExternalPipeline, Pipeline, PipelineError, Stage, StageArg, StageCommand,
};
pub use server::{ServerError, bind, serve, serve_with_listener, spawn_signal_handler};
pub use supervisor::{ServerState, Supervisor, SupervisorConfig, SupervisorPhase};
pub use wire::{ProtocolError, ResponseHeader, TransferRequest};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerId, WorkerOutcome, WorkerStatus};
