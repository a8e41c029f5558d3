//! # Stack Snapshots
//!
//! Captures the call stack of the current thread as an immutable, ordered
//! list of frames for inclusion in recovery log entries.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

// Rendered in place of frames when the platform yields none.
const UNAVAILABLE: &str = "<stack trace unavailable>";

/// One resolved frame of a captured stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Position in the snapshot, 0 being the innermost frame
    pub index: usize,
    /// Demangled symbol name, if it could be resolved
    pub symbol: Option<String>,
    /// Source file, if debug info is available
    pub file: Option<PathBuf>,
    /// Source line, if debug info is available
    pub line: Option<u32>,
}

/// An ordered, immutable call-stack snapshot.
///
/// Clones share the same frames.
#[derive(Debug, Clone)]
pub struct StackSnapshot {
    frames: Arc<[StackFrame]>,
}

impl StackSnapshot {
    /// Captures the stack of the calling thread.
    ///
    /// Frames belonging to the capture machinery itself are dropped so the
    /// snapshot starts at the caller.
    pub fn capture() -> Self {
        let trace = backtrace::Backtrace::new();
        let mut frames = Vec::new();

        for frame in trace.frames() {
            let symbols = frame.symbols();
            if symbols.is_empty() {
                frames.push((None, None, None));
                continue;
            }
            for symbol in symbols {
                let name = symbol.name().map(|name| format!("{:#}", name));
                let file = symbol.filename().map(|path| path.to_path_buf());
                frames.push((name, file, symbol.lineno()));
            }
        }

        // Skip everything up to and including our own capture frame
        let skip = frames
            .iter()
            .rposition(|(name, _, _)| {
                name.as_deref()
                    .map_or(false, |name| name.ends_with("StackSnapshot::capture"))
            })
            .map_or(0, |pos| pos + 1);

        let frames = frames
            .into_iter()
            .skip(skip)
            .enumerate()
            .map(|(index, (symbol, file, line))| StackFrame {
                index,
                symbol,
                file,
                line,
            })
            .collect::<Vec<_>>();

        Self::from_frames(frames)
    }

    /// Builds a snapshot from already resolved frames
    pub fn from_frames(frames: Vec<StackFrame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return write!(f, "{}", UNAVAILABLE);
        }

        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{:>4}: {}",
                frame.index,
                frame.symbol.as_deref().unwrap_or("<unknown>")
            )?;
            if let Some(file) = &frame.file {
                write!(f, "\n             at {}", file.display())?;
                if let Some(line) = frame.line {
                    write!(f, ":{}", line)?;
                }
            }
        }

        Ok(())
    }
}
