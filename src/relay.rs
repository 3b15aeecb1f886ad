//! Cross-process log funnel
//!
//! Every producer (the supervisor's own tracing output and the stdout of each
//! worker process) pushes fully formatted lines into one unbounded queue. A
//! single consumer task drains the queue in FIFO order and writes each line to
//! the configured sink. Producers never block on the consumer.

use crate::config::LoggerConfig;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

/// Where relayed lines end up
#[derive(Debug, Clone, PartialEq)]
pub enum LogSink {
    Stdout,
    File(PathBuf),
    Discard,
}

impl LogSink {
    pub fn from_config(config: &LoggerConfig) -> Self {
        if !config.enabled {
            LogSink::Discard
        } else if config.file == "-" {
            LogSink::Stdout
        } else {
            LogSink::File(PathBuf::from(&config.file))
        }
    }
}

/// Format a log line as `timestamp: source: message`
pub fn format_line(source: &str, message: &str) -> String {
    format!("{}: {}: {}", timestamp(), source, message)
}

fn timestamp() -> String {
    chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

enum RelayMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Producer handle for the log queue. Cheap to clone.
#[derive(Clone)]
pub struct LogRelay {
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl LogRelay {
    /// Start the consumer task writing to `sink`.
    ///
    /// The returned handle finishes once every `LogRelay` clone has been dropped
    /// and the queue is drained.
    pub async fn start(sink: LogSink) -> io::Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = SinkWriter::open(&sink).await?;
        let handle = tokio::spawn(consume(rx, writer));
        Ok((Self { tx }, handle))
    }

    /// Enqueue a line that is already formatted
    pub fn send_line(&self, line: impl Into<String>) {
        // A closed queue means the consumer is gone; there is nowhere left to log.
        let _ = self.tx.send(RelayMessage::Line(line.into()));
    }

    /// Wait until every line queued before this call has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RelayMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Format and enqueue a message from `source`
    pub fn log(&self, source: &str, message: &str) {
        self.send_line(format_line(source, message));
    }

    /// Forward every line read from `reader` (a worker's stdout) into the queue.
    pub fn attach<R>(&self, source: String, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            relay.send_line(line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        relay.log(&source, &format!("log stream error: {}", e));
                        break;
                    }
                }
            }
        })
    }
}

enum SinkWriter {
    Stdout(tokio::io::Stdout),
    File(tokio::fs::File),
    Discard,
}

impl SinkWriter {
    async fn open(sink: &LogSink) -> io::Result<Self> {
        Ok(match sink {
            LogSink::Stdout => SinkWriter::Stdout(tokio::io::stdout()),
            LogSink::File(path) => SinkWriter::File(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            LogSink::Discard => SinkWriter::Discard,
        })
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line.trim_end_matches('\n'));
        buf.push('\n');
        match self {
            SinkWriter::Stdout(out) => {
                out.write_all(buf.as_bytes()).await?;
                out.flush().await
            }
            SinkWriter::File(file) => {
                file.write_all(buf.as_bytes()).await?;
                file.flush().await
            }
            SinkWriter::Discard => Ok(()),
        }
    }
}

async fn consume(mut rx: mpsc::UnboundedReceiver<RelayMessage>, mut writer: SinkWriter) {
    while let Some(message) = rx.recv().await {
        match message {
            RelayMessage::Line(line) => {
                if let Err(e) = writer.write_line(&line).await {
                    eprintln!("multiserver: failed to write log line: {}", e);
                }
            }
            RelayMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Writer that pushes each formatted tracing event into the relay queue
pub struct RelayWriter {
    relay: LogRelay,
    buf: Vec<u8>,
}

impl io::Write for RelayWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf);
            for line in text.lines() {
                self.relay.send_line(line);
            }
            self.buf.clear();
        }
        Ok(())
    }
}

impl Drop for RelayWriter {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for LogRelay {
    type Writer = RelayWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RelayWriter {
            relay: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// Event formatter producing `timestamp: label: [LEVEL ]message fields`
#[derive(Debug, Clone)]
pub struct RelayFormat {
    label: String,
}

impl RelayFormat {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for RelayFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        write!(writer, "{}: {}: ", timestamp(), self.label)?;
        if level != Level::INFO {
            write!(writer, "{} ", level)?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global tracing subscriber for a process.
///
/// The supervisor passes its relay as the writer; workers write to stdout,
/// which the supervisor reads back into the same relay.
pub fn init_tracing<W>(label: String, debug: bool, writer: W)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // A subscriber may already be installed (e.g. in tests); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(RelayFormat::new(label))
        .with_writer(writer)
        .try_init();
}
