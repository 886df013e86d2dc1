//! Worker: owns one accepted connection from payload receipt to close.
//!
//! The supervisor has already read and validated the request header before a
//! worker exists. The worker then:
//! 1. Receives exactly `size` payload bytes into its input artifact
//! 2. Runs the conversion pipeline
//! 3. Sends the response header and the converted document
//! 4. Removes all artifacts and closes the connection, on every path
//!
//! The result is reported once, as a [`WorkerOutcome`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::artifacts::ArtifactSet;
use crate::pipeline::{Pipeline, PipelineError};
use crate::wire::{ResponseHeader, TransferRequest, write_response_header};

/// Default size of payload and response chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Identifier the supervisor assigns to each spawned worker.
///
/// Sequential within a server process; also part of every artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Response fully sent.
    Success,
    /// Clean exit after a transfer, pipeline or resource error.
    Failure,
    /// The worker task panicked or was aborted.
    Crashed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "succeeded",
            Self::Failure => "failed",
            Self::Crashed => "crashed",
        }
    }
}

/// Termination report for one worker, consumed once by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub error: Option<String>,
}

impl WorkerOutcome {
    pub fn success(id: WorkerId) -> Self {
        Self {
            id,
            status: WorkerStatus::Success,
            error: None,
        }
    }

    pub fn failure(id: WorkerId, error: impl Into<String>) -> Self {
        Self {
            id,
            status: WorkerStatus::Failure,
            error: Some(error.into()),
        }
    }

    pub fn crashed(id: WorkerId, error: impl Into<String>) -> Self {
        Self {
            id,
            status: WorkerStatus::Crashed,
            error: Some(error.into()),
        }
    }
}

/// Errors that end a worker early.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("client closed the connection after {received} of {expected} payload bytes")]
    ShortPayload { received: u64, expected: u64 },

    #[error("transfer failed while {action}: {source}")]
    Transfer {
        action: &'static str,
        source: io::Error,
    },

    #[error("sent {sent} bytes but announced {declared}")]
    ResponseMismatch { declared: u64, sent: u64 },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("artifact {path} unavailable: {source}")]
    Resource { path: PathBuf, source: io::Error },
}

impl WorkerError {
    fn transfer(action: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Transfer { action, source }
    }

    fn resource(path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Resource { path, source }
    }

    /// Error class used in logs: `transfer`, `pipeline` or `resource`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ShortPayload { .. } | Self::Transfer { .. } | Self::ResponseMismatch { .. } => {
                "transfer"
            }
            Self::Pipeline(_) => "pipeline",
            Self::Resource { .. } => "resource",
        }
    }
}

/// Settings shared by all workers of one server.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub work_dir: PathBuf,
    pub chunk_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// One client interaction, ready to run.
pub struct Worker<S> {
    id: WorkerId,
    stream: S,
    request: TransferRequest,
    pipeline: Arc<dyn Pipeline>,
    config: Arc<WorkerConfig>,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: WorkerId,
        stream: S,
        request: TransferRequest,
        pipeline: Arc<dyn Pipeline>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Self {
            id,
            stream,
            request,
            pipeline,
            config,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run to completion. Never fails: errors become a `Failure` outcome.
    pub async fn run(self) -> WorkerOutcome {
        let Self {
            id,
            mut stream,
            request,
            pipeline,
            config,
        } = self;

        let mut artifacts = ArtifactSet::for_worker(&config.work_dir, id, &request.name);
        tracing::debug!(
            worker = %id,
            input = %artifacts.input().display(),
            intermediate = %artifacts.intermediate().display(),
            output = %artifacts.output().display(),
            "Derived artifact paths"
        );

        let result = serve(
            &mut stream,
            &request,
            pipeline.as_ref(),
            &artifacts,
            config.chunk_size.max(1),
        )
        .await;

        if let Err(e) = artifacts.cleanup() {
            tracing::warn!(worker = %id, error = %e, "Artifact cleanup incomplete");
        }
        if let Err(e) = stream.shutdown().await {
            tracing::debug!(worker = %id, error = %e, "Connection shutdown failed");
        }
        drop(stream);

        match result {
            Ok(sent) => {
                tracing::debug!(worker = %id, sent, "Response sent");
                WorkerOutcome::success(id)
            }
            Err(e) => {
                tracing::warn!(worker = %id, kind = e.kind(), error = %e, "Worker aborted");
                WorkerOutcome::failure(id, e.to_string())
            }
        }
    }
}

async fn serve<S>(
    stream: &mut S,
    request: &TransferRequest,
    pipeline: &dyn Pipeline,
    artifacts: &ArtifactSet,
    chunk_size: usize,
) -> Result<u64, WorkerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    receive_payload(stream, request.size, artifacts, chunk_size).await?;

    let document = pipeline.convert(artifacts).await?;
    tracing::debug!(path = %document.path.display(), size = document.size, "Document converted");

    send_document(stream, &document.path, document.size, chunk_size).await
}

/// Copy exactly `expected` bytes from `stream` into the input artifact.
async fn receive_payload<S>(
    stream: &mut S,
    expected: u64,
    artifacts: &ArtifactSet,
    chunk_size: usize,
) -> Result<(), WorkerError>
where
    S: AsyncRead + Unpin,
{
    let path = artifacts.input();
    let mut file = File::create(path)
        .await
        .map_err(WorkerError::resource(path))?;

    let mut buf = vec![0u8; chunk_size];
    let mut received: u64 = 0;
    while received < expected {
        let want = (expected - received).min(chunk_size as u64) as usize;
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(WorkerError::transfer("receiving payload"))?;
        if n == 0 {
            return Err(WorkerError::ShortPayload { received, expected });
        }
        file.write_all(&buf[..n])
            .await
            .map_err(WorkerError::resource(path))?;
        received += n as u64;
    }

    file.flush().await.map_err(WorkerError::resource(path))?;
    tracing::debug!(path = %path.display(), received, "Payload received");
    Ok(())
}

/// Send the response header followed by the converted document.
async fn send_document<S>(
    stream: &mut S,
    path: &Path,
    declared: u64,
    chunk_size: usize,
) -> Result<u64, WorkerError>
where
    S: AsyncWrite + Unpin,
{
    let mut file = File::open(path)
        .await
        .map_err(WorkerError::resource(path))?;

    write_response_header(stream, ResponseHeader { size: declared })
        .await
        .map_err(WorkerError::transfer("sending response header"))?;

    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;
    while sent < declared {
        let want = (declared - sent).min(chunk_size as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(WorkerError::resource(path))?;
        if n == 0 {
            break;
        }
        stream
            .write_all(&buf[..n])
            .await
            .map_err(WorkerError::transfer("sending document"))?;
        sent += n as u64;
    }
    stream
        .flush()
        .await
        .map_err(WorkerError::transfer("flushing document"))?;

    if sent != declared {
        return Err(WorkerError::ResponseMismatch { declared, sent });
    }
    Ok(sent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::{ConvertedDocument, Stage};
    use crate::wire::read_response_header;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    /// Writes `prefix + input` as the converted document.
    pub(crate) struct PrefixPipeline(pub &'static [u8]);

    #[async_trait]
    impl Pipeline for PrefixPipeline {
        async fn convert(
            &self,
            artifacts: &ArtifactSet,
        ) -> Result<ConvertedDocument, PipelineError> {
            let mut doc = self.0.to_vec();
            doc.extend(std::fs::read(artifacts.input()).unwrap());
            std::fs::write(artifacts.intermediate(), b"ps").unwrap();
            std::fs::write(artifacts.output(), &doc).unwrap();
            Ok(ConvertedDocument {
                path: artifacts.output().to_path_buf(),
                size: doc.len() as u64,
            })
        }
    }

    /// Fails like a missing stage-1 executable.
    pub(crate) struct MissingToolPipeline;

    #[async_trait]
    impl Pipeline for MissingToolPipeline {
        async fn convert(
            &self,
            _artifacts: &ArtifactSet,
        ) -> Result<ConvertedDocument, PipelineError> {
            Err(PipelineError::Spawn {
                stage: Stage::TextToPostScript,
                program: PathBuf::from("/nonexistent/enscript"),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
        }
    }

    /// Reports a larger size than it wrote.
    struct LyingPipeline;

    #[async_trait]
    impl Pipeline for LyingPipeline {
        async fn convert(
            &self,
            artifacts: &ArtifactSet,
        ) -> Result<ConvertedDocument, PipelineError> {
            std::fs::write(artifacts.output(), b"short").unwrap();
            Ok(ConvertedDocument {
                path: artifacts.output().to_path_buf(),
                size: 100,
            })
        }
    }

    /// Produces an empty document.
    struct EmptyPipeline;

    #[async_trait]
    impl Pipeline for EmptyPipeline {
        async fn convert(
            &self,
            artifacts: &ArtifactSet,
        ) -> Result<ConvertedDocument, PipelineError> {
            std::fs::write(artifacts.output(), b"").unwrap();
            Ok(ConvertedDocument {
                path: artifacts.output().to_path_buf(),
                size: 0,
            })
        }
    }

    fn worker(
        dir: &Path,
        stream: DuplexStream,
        request: TransferRequest,
        pipeline: Arc<dyn Pipeline>,
    ) -> Worker<DuplexStream> {
        let config = Arc::new(WorkerConfig {
            work_dir: dir.to_path_buf(),
            chunk_size: 4,
        });
        Worker::new(WorkerId::new(1), stream, request, pipeline, config)
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn converts_and_streams_document_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64);
        let request = TransferRequest::new("report.txt", 13);
        let w = worker(dir.path(), server, request, Arc::new(PrefixPipeline(b"%PDF ")));

        let handle = tokio::spawn(w.run());
        client.write_all(b"Hello, world!").await.unwrap();

        let header = read_response_header(&mut client).await.unwrap();
        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();

        assert_eq!(header.size, 18);
        assert_eq!(body, b"%PDF Hello, world!");
        assert_eq!(handle.await.unwrap(), WorkerOutcome::success(WorkerId::new(1)));
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn does_not_read_past_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64);
        let request = TransferRequest::new("a.txt", 3);
        let w = worker(dir.path(), server, request, Arc::new(PrefixPipeline(b"")));

        client.write_all(b"abcdef").await.unwrap();
        let outcome = w.run().await;
        assert_eq!(outcome.status, WorkerStatus::Success);

        let header = read_response_header(&mut client).await.unwrap();
        assert_eq!(header.size, 3);
        let mut body = vec![0u8; 3];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"abc");
    }

    #[tokio::test]
    async fn short_payload_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64);
        let request = TransferRequest::new("a.txt", 100);
        let w = worker(dir.path(), server, request, Arc::new(PrefixPipeline(b"")));

        client.write_all(b"only ten b").await.unwrap();
        drop(client);

        let outcome = w.run().await;
        assert_eq!(outcome.status, WorkerStatus::Failure);
        insta::assert_snapshot!(
            outcome.error.unwrap(),
            @"client closed the connection after 10 of 100 payload bytes"
        );
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn pipeline_failure_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(64);
        let request = TransferRequest::new("a.txt", 2);
        let w = worker(dir.path(), server, request, Arc::new(MissingToolPipeline));

        let handle = tokio::spawn(w.run());
        client.write_all(b"hi").await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, WorkerStatus::Failure);
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn empty_document_is_sent_with_zero_header() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(256);
        let request = TransferRequest::new("blank.txt", 2);
        let w = worker(dir.path(), server, request, Arc::new(EmptyPipeline));

        client.write_all(b"\n\n").await.unwrap();
        let outcome = w.run().await;
        assert_eq!(outcome, WorkerOutcome::success(WorkerId::new(1)));

        let header = read_response_header(&mut client).await.unwrap();
        assert_eq!(header.size, 0);
        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        assert!(body.is_empty());
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn size_mismatch_is_a_transfer_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, server) = tokio::io::duplex(256);
        let request = TransferRequest::new("a.txt", 1);
        let w = worker(dir.path(), server, request, Arc::new(LyingPipeline));

        client.write_all(b"x").await.unwrap();
        let outcome = w.run().await;
        assert_eq!(outcome.status, WorkerStatus::Failure);
        assert_eq!(
            outcome.error.as_deref(),
            Some("sent 5 bytes but announced 100")
        );
        assert!(dir_is_empty(dir.path()));
    }

    #[test]
    fn error_kinds() {
        let short = WorkerError::ShortPayload {
            received: 1,
            expected: 2,
        };
        assert_eq!(short.kind(), "transfer");
        let resource = WorkerError::Resource {
            path: PathBuf::from("/x"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(resource.kind(), "resource");
    }
}
