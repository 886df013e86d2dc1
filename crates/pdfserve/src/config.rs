//! Runtime configuration.
//!
//! [`CliArgs`] is what the binary parses (flags with environment fallbacks).
//! [`ServerConfig`] is the validated form the library consumes.

use std::io::{self, BufRead, Write};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::Parser;

use crate::pipeline::{
    DEFAULT_PS_TO_PDF, DEFAULT_TEXT_TO_PS, ExternalPipeline, StageCommand,
};
use crate::supervisor::{
    DEFAULT_HEADER_TIMEOUT, DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_WORKERS, SupervisorConfig,
};
use crate::worker::{DEFAULT_CHUNK_SIZE, WorkerConfig};

pub const DEFAULT_PORT_MIN: u16 = 1024;
pub const DEFAULT_PORT_MAX: u16 = 65535;
pub const DEFAULT_BACKLOG: u32 = 128;

/// Command line for the `pdfserve` binary.
///
/// Every flag can also come from the environment, which is how the server is
/// usually configured when run under a process manager.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pdfserve",
    version,
    about = "Receive text documents over TCP and send back PDFs"
)]
pub struct CliArgs {
    /// Port to listen on. Prompted for on stdin when omitted.
    #[arg(env = "PDFSERVE_PORT")]
    pub port: Option<u16>,

    /// Address to bind.
    #[arg(long, env = "PDFSERVE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Lowest port accepted, on the command line or at the prompt.
    #[arg(long, default_value_t = DEFAULT_PORT_MIN)]
    pub port_min: u16,

    /// Highest port accepted, on the command line or at the prompt.
    #[arg(long, default_value_t = DEFAULT_PORT_MAX)]
    pub port_max: u16,

    /// Listen backlog.
    #[arg(long, env = "PDFSERVE_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    pub backlog: u32,

    /// Directory for per-connection temporary files. Defaults to the system
    /// temp directory.
    #[arg(long, env = "PDFSERVE_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Stop accepting after this many connections and exit once they finish.
    /// 0 serves until interrupted.
    #[arg(long, env = "PDFSERVE_MAX_CONNECTIONS", default_value_t = 0)]
    pub max_connections: u64,

    /// Maximum conversions running at once.
    #[arg(long, env = "PDFSERVE_MAX_WORKERS", default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    /// Largest payload a client may announce.
    #[arg(long, env = "PDFSERVE_MAX_PAYLOAD_BYTES", default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_payload_bytes: u64,

    /// Read/write chunk size for payloads and responses.
    #[arg(long, env = "PDFSERVE_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Seconds a client has to send its request header. 0 waits forever.
    #[arg(long, env = "PDFSERVE_HEADER_TIMEOUT_SECS", default_value_t = DEFAULT_HEADER_TIMEOUT.as_secs())]
    pub header_timeout_secs: u64,

    /// Seconds a conversion stage may run before it is killed. 0 waits forever.
    #[arg(long, env = "PDFSERVE_STAGE_TIMEOUT_SECS", default_value_t = 0)]
    pub stage_timeout_secs: u64,

    /// Text to PostScript converter (enscript-compatible).
    #[arg(long, env = "PDFSERVE_TEXT_TO_PS", default_value = DEFAULT_TEXT_TO_PS)]
    pub text_to_ps: PathBuf,

    /// PostScript to PDF converter (ps2pdf-compatible).
    #[arg(long, env = "PDFSERVE_PS_TO_PDF", default_value = DEFAULT_PS_TO_PDF)]
    pub ps_to_pdf: PathBuf,
}

impl CliArgs {
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_min..=self.port_max
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub work_dir: PathBuf,
    pub chunk_size: usize,
    pub supervisor: SupervisorConfig,
    pub text_to_ps: StageCommand,
    pub ps_to_pdf: StageCommand,
    pub stage_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            work_dir: self.work_dir.clone(),
            chunk_size: self.chunk_size,
        }
    }

    pub fn pipeline(&self) -> ExternalPipeline {
        ExternalPipeline::new(self.text_to_ps.clone(), self.ps_to_pdf.clone())
            .with_stage_timeout(self.stage_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            backlog: DEFAULT_BACKLOG,
            work_dir: std::env::temp_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            supervisor: SupervisorConfig::default(),
            text_to_ps: StageCommand::text_to_postscript(DEFAULT_TEXT_TO_PS),
            ps_to_pdf: StageCommand::postscript_to_pdf(DEFAULT_PS_TO_PDF),
            stage_timeout: None,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.port_min > args.port_max {
            bail!(
                "--port-min ({}) must not exceed --port-max ({})",
                args.port_min,
                args.port_max
            );
        }
        let port = args
            .port
            .ok_or_else(|| anyhow!("a port number is required"))?;
        if !args.port_range().contains(&port) {
            bail!(
                "port {port} is outside the legal range {}-{}",
                args.port_min,
                args.port_max
            );
        }
        if args.max_workers == 0 {
            bail!("--max-workers must be greater than 0");
        }
        if args.chunk_size == 0 {
            bail!("--chunk-size must be greater than 0");
        }
        if args.max_payload_bytes == 0 {
            bail!("--max-payload-bytes must be greater than 0");
        }

        Ok(Self {
            host: args.host,
            port,
            backlog: args.backlog,
            work_dir: args.work_dir.unwrap_or_else(std::env::temp_dir),
            chunk_size: args.chunk_size,
            supervisor: SupervisorConfig {
                max_connections: (args.max_connections > 0).then_some(args.max_connections),
                max_workers: args.max_workers,
                max_payload: args.max_payload_bytes,
                header_timeout: seconds(args.header_timeout_secs),
            },
            text_to_ps: StageCommand::text_to_postscript(args.text_to_ps),
            ps_to_pdf: StageCommand::postscript_to_pdf(args.ps_to_pdf),
            stage_timeout: seconds(args.stage_timeout_secs),
        })
    }
}

/// 0 means "no limit".
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Ask for a port on `output` until `input` yields one inside `range`.
///
/// Fails only if `input` ends or errors.
pub fn prompt_port<R, W>(mut input: R, mut output: W, range: RangeInclusive<u16>) -> io::Result<u16>
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        write!(output, "Port number ({}-{})? ", range.start(), range.end())?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no port number entered",
            ));
        }
        if let Ok(port) = line.trim().parse::<u16>()
            && range.contains(&port)
        {
            return Ok(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("pdfserve").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_follow_the_original_tools() {
        let config = ServerConfig::try_from(parse(&["8080"])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.text_to_ps.program, PathBuf::from(DEFAULT_TEXT_TO_PS));
        assert_eq!(config.ps_to_pdf.program, PathBuf::from(DEFAULT_PS_TO_PDF));
        assert_eq!(config.supervisor.max_connections, None);
        assert_eq!(config.supervisor.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(config.supervisor.header_timeout, Some(DEFAULT_HEADER_TIMEOUT));
        assert_eq!(config.stage_timeout, None);
    }

    #[test]
    fn zero_means_unbounded() {
        let config = ServerConfig::try_from(parse(&[
            "8080",
            "--max-connections",
            "0",
            "--header-timeout-secs",
            "0",
        ]))
        .unwrap();
        assert_eq!(config.supervisor.max_connections, None);
        assert_eq!(config.supervisor.header_timeout, None);

        let config = ServerConfig::try_from(parse(&[
            "8080",
            "--max-connections",
            "10",
            "--stage-timeout-secs",
            "5",
        ]))
        .unwrap();
        assert_eq!(config.supervisor.max_connections, Some(10));
        assert_eq!(config.stage_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn port_outside_range_is_rejected() {
        let err = ServerConfig::try_from(parse(&["80"])).unwrap_err();
        insta::assert_snapshot!(err, @"port 80 is outside the legal range 1024-65535");

        let config =
            ServerConfig::try_from(parse(&["80", "--port-min", "1", "--port-max", "100"])).unwrap();
        assert_eq!(config.port, 80);
    }

    #[test]
    fn missing_port_is_an_error_after_parsing() {
        let args = parse(&[]);
        assert!(args.port.is_none());
        assert!(ServerConfig::try_from(args).is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(ServerConfig::try_from(parse(&["8080", "--max-workers", "0"])).is_err());
    }

    #[test]
    fn prompt_repeats_until_port_is_legal() {
        let input = io::Cursor::new("abc\n80\n70000\n8080\n");
        let mut output = Vec::new();
        let port = prompt_port(input, &mut output, 1024..=65535).unwrap();
        assert_eq!(port, 8080);

        let prompts = String::from_utf8(output).unwrap();
        assert_eq!(prompts.matches("Port number (1024-65535)? ").count(), 4);
    }

    #[test]
    fn prompt_fails_on_eof() {
        let input = io::Cursor::new("nope\n");
        let err = prompt_port(input, io::sink(), 1024..=65535).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
