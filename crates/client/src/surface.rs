//! Terminal surfaces the session manager renders into.
//!
//! Emulation and rendering belong to the surface; the manager only writes
//! raw terminal data and banners and asks for the current geometry.

use std::io::{self, Write};

use protocol::TerminalSize;

/// Something that displays terminal output.
pub trait TerminalSurface {
    /// Write raw terminal data verbatim.
    fn write(&mut self, data: &str);

    /// Write `line` followed by a carriage return and line feed.
    fn write_line(&mut self, line: &str) {
        self.write(line);
        self.write("\r\n");
    }

    /// Reset the surface before a different session is shown.
    fn clear(&mut self);

    /// Current geometry in character cells.
    fn size(&self) -> TerminalSize;
}

/// In-memory surface. Keeps everything written since the last `clear`.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    contents: String,
    size: TerminalSize,
    clears: usize,
}

impl MemorySurface {
    pub fn new(size: TerminalSize) -> Self {
        Self {
            contents: String::new(),
            size,
            clears: 0,
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// How many times the surface was cleared.
    pub fn clears(&self) -> usize {
        self.clears
    }

    pub fn set_size(&mut self, size: TerminalSize) {
        self.size = size;
    }
}

impl TerminalSurface for MemorySurface {
    fn write(&mut self, data: &str) {
        self.contents.push_str(data);
    }

    fn clear(&mut self) {
        self.contents.clear();
        self.clears += 1;
    }

    fn size(&self) -> TerminalSize {
        self.size
    }
}

/// Surface backed by a writer, normally the controlling terminal.
pub struct WriterSurface<W: Write> {
    writer: W,
    fallback_size: TerminalSize,
}

impl WriterSurface<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> WriterSurface<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            fallback_size: TerminalSize::default(),
        }
    }

    /// Size reported when the terminal size cannot be queried.
    pub fn with_fallback_size(mut self, size: TerminalSize) -> Self {
        self.fallback_size = size;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TerminalSurface for WriterSurface<W> {
    fn write(&mut self, data: &str) {
        let result = self
            .writer
            .write_all(data.as_bytes())
            .and_then(|_| self.writer.flush());
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to write to terminal");
        }
    }

    fn clear(&mut self) {
        // Clear screen and scrollback, home the cursor.
        self.write("\x1b[2J\x1b[3J\x1b[H");
    }

    fn size(&self) -> TerminalSize {
        match crossterm::terminal::size() {
            Ok((cols, rows)) if cols > 0 && rows > 0 => TerminalSize::new(rows, cols),
            _ => self.fallback_size,
        }
    }
}
