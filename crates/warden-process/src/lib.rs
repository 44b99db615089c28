mod lines;
mod process;
mod stdio_cache;

pub use lines::LineReader;
pub use process::{ExitInfo, Process, ProcessError, ProcessSpec, ProcessState, ProcessStatus};
pub use stdio_cache::{CachedLine, StdioCache, StdioChunk};

/// Which of the two output pipes a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
