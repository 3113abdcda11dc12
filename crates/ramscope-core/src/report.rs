//! Streaming report output.
//!
//! The engine emits structured records through a sink; file naming and
//! formatting policy belong to the caller (the CLI), not to the core.

use std::io::Write;

use tracing::warn;

/// Record-at-a-time output interface.
pub trait ReportSink
{
    /// Emit one text line (no trailing newline required of the caller).
    fn line(&mut self, text: &str);

    /// Emit a raw byte span (for extracted buffers).
    fn raw(&mut self, bytes: &[u8]);
}

/// Sink over any `Write`. Output errors are logged once and swallowed;
/// a broken report file must not abort the analysis producing it.
pub struct WriteSink<W: Write>
{
    inner: W,
    failed: bool,
}

impl<W: Write> WriteSink<W>
{
    pub fn new(inner: W) -> Self
    {
        Self { inner, failed: false }
    }

    pub fn into_inner(self) -> W
    {
        self.inner
    }

    fn note_failure(&mut self, err: &std::io::Error)
    {
        if !self.failed {
            warn!("report sink write failed: {err}");
            self.failed = true;
        }
    }
}

impl<W: Write> ReportSink for WriteSink<W>
{
    fn line(&mut self, text: &str)
    {
        if let Err(err) = writeln!(self.inner, "{text}") {
            self.note_failure(&err);
        }
    }

    fn raw(&mut self, bytes: &[u8])
    {
        if let Err(err) = self.inner.write_all(bytes) {
            self.note_failure(&err);
        }
    }
}

/// In-memory sink for tests and for callers that post-process records.
#[derive(Default)]
pub struct BufferSink
{
    pub lines: Vec<String>,
    pub bytes: Vec<u8>,
}

impl BufferSink
{
    pub fn new() -> Self
    {
        Self::default()
    }
}

impl ReportSink for BufferSink
{
    fn line(&mut self, text: &str)
    {
        self.lines.push(text.to_string());
    }

    fn raw(&mut self, bytes: &[u8])
    {
        self.bytes.extend_from_slice(bytes);
    }
}
