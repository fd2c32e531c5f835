//! Where `print` output goes.
//!
//! A trait so tests (and embedders) can capture output without redirecting
//! the process's real stdout, in the same shape as a print-writer
//! abstraction for a sandboxed interpreter: a default that writes to real
//! stdout, and a collecting implementation for anything that needs to
//! compare output byte-for-byte.

pub trait PrintSink {
    /// Called once per `print` statement with the fully formatted line
    /// (no trailing newline — the sink decides how lines are terminated).
    fn print_line(&mut self, line: &str);
}

#[derive(Debug, Default)]
pub struct StdoutSink;

impl PrintSink for StdoutSink {
    fn print_line(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Collects every printed line into memory instead of writing anywhere,
/// for fixture tests that assert on exact output.
#[derive(Debug, Default)]
pub struct CollectingSink {
    lines: Vec<String>,
}

impl PrintSink for CollectingSink {
    fn print_line(&mut self, line: &str) {
        self.lines.push(line.to_owned());
    }
}

impl CollectingSink {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Joins every collected line with `\n`, with a trailing `\n` if
    /// anything was printed at all — matching what `println!` would have
    /// written to a real stream.
    pub fn output(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut joined = self.lines.join("\n");
        joined.push('\n');
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_joins_with_trailing_newline() {
        let mut sink = CollectingSink::default();
        sink.print_line("a");
        sink.print_line("b");
        assert_eq!(sink.output(), "a\nb\n");
    }

    #[test]
    fn empty_collecting_sink_has_empty_output() {
        assert_eq!(CollectingSink::default().output(), "");
    }
}
