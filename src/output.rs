//! Labeled output forwarding and the merged log feed.
//!
//! Every managed process writes through its own [`OutputSink`], which buffers
//! partial lines and hands complete, labeled lines to the shared [`LogFeed`].
//! The feed serializes all writers behind one mutex, keeps a bounded ring of
//! recent lines for the log pane and optionally mirrors them to a file.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// One complete line in the merged feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLine {
    /// Label of the writer, normally the application name.
    pub label: Arc<str>,
    /// Line content without the trailing newline or ANSI escapes.
    pub text: String,
    pub stream: StreamKind,
}

/// The shared destination for all process output.
#[derive(Clone)]
pub struct LogFeed {
    inner: Arc<Mutex<FeedInner>>,
}

struct FeedInner {
    max_lines: usize,
    lines: VecDeque<FeedLine>,
    seq: u64,
    mirror: Option<Box<dyn Write + Send>>,
}

impl LogFeed {
    /// Creates a feed that keeps at most `max_lines` lines.
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                max_lines,
                lines: VecDeque::with_capacity(max_lines.min(1024)),
                seq: 0,
                mirror: None,
            })),
        }
    }

    /// Copies every subsequent line to `writer` as `label<TAB>text`.
    pub fn set_mirror(&self, writer: impl Write + Send + 'static) {
        self.lock().mirror = Some(Box::new(writer));
    }

    /// Returns a sink that labels everything written to it with `label`.
    pub fn sink(&self, label: impl Into<Arc<str>>, stream: StreamKind) -> OutputSink {
        OutputSink {
            label: label.into(),
            stream,
            feed: self.clone(),
            pending: Vec::new(),
        }
    }

    /// Appends a complete line.
    pub fn push(&self, label: Arc<str>, text: String, stream: StreamKind) {
        let mut inner = self.lock();
        if let Some(mirror) = inner.mirror.as_mut() {
            if writeln!(mirror, "{}\t{}", label, text).is_err() {
                inner.mirror = None;
            }
        }
        inner.lines.push_back(FeedLine {
            label,
            text,
            stream,
        });
        while inner.lines.len() > inner.max_lines {
            inner.lines.pop_front();
        }
        inner.seq += 1;
    }

    /// Counts every line ever pushed; changes whenever the feed changes.
    pub fn seq(&self) -> u64 {
        self.lock().seq
    }

    /// Returns the number of lines currently retained.
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    /// Copies up to `count` retained lines starting at `start`.
    pub fn window(&self, start: usize, count: usize) -> Vec<FeedLine> {
        self.lock()
            .lines
            .iter()
            .skip(start)
            .take(count)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LogFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("LogFeed")
            .field("max_lines", &inner.max_lines)
            .field("len", &inner.lines.len())
            .field("seq", &inner.seq)
            .finish()
    }
}

/// Per-process labeling writer in front of the shared [`LogFeed`].
///
/// A sink has a single writer. Bytes are buffered until a newline so that a
/// line is always pushed to the feed whole; whatever is left over is pushed on
/// [`Write::flush`] or when the sink is dropped.
pub struct OutputSink {
    label: Arc<str>,
    stream: StreamKind,
    feed: LogFeed,
    pending: Vec<u8>,
}

impl OutputSink {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// A fresh sink with the same label and feed, writing as `stream`.
    pub fn for_stream(&self, stream: StreamKind) -> OutputSink {
        OutputSink {
            label: self.label.clone(),
            stream,
            feed: self.feed.clone(),
            pending: Vec::new(),
        }
    }

    /// Pushes `text` as one line, bypassing the partial-line buffer.
    pub fn note(&self, text: impl AsRef<str>) {
        self.feed
            .push(self.label.clone(), clean_line(text.as_ref().as_bytes()), self.stream);
    }

    fn emit(&mut self, line: &[u8]) {
        self.feed.push(self.label.clone(), clean_line(line), self.stream);
    }
}

impl Clone for OutputSink {
    fn clone(&self) -> Self {
        self.for_stream(self.stream)
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("label", &self.label)
            .field("stream", &self.stream)
            .finish()
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..pos]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
        Ok(())
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

// Keeps only what a terminal would show after the last carriage return.
fn clean_line(raw: &[u8]) -> String {
    let mut raw = raw;
    while let [rest @ .., b'\r'] = raw {
        raw = rest;
    }
    let last = raw.rsplit(|b| *b == b'\r').next().unwrap_or(&[]);
    sanitize_text(&String::from_utf8_lossy(last))
}

/// Removes ANSI escape codes. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
