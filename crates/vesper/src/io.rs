use std::{
    borrow::Cow,
    io::{self, Write as _},
};

/// Trait for handling output produced by `print` and the `printf` native.
///
/// Implement this trait to capture or redirect script output. The default
/// implementation [`StdPrint`] writes to stdout.
pub trait PrintWriter {
    /// Called once for each formatted value.
    ///
    /// This method is responsible for writing only the given value's text and
    /// must not add separators or a trailing newline. The statement terminator
    /// (a newline after `print`) is emitted via [`PrintWriter::stdout_push`].
    fn stdout_write(&mut self, output: Cow<'_, str>);

    /// Adds a single character to stdout.
    ///
    /// Called to terminate `print` statements with a newline.
    fn stdout_push(&mut self, end: char);
}

/// Default `PrintWriter` that writes to stdout.
///
/// Write errors are ignored: script output is best-effort, and a broken pipe
/// must not turn into a runtime error inside the interpreter.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(output.as_bytes());
    }

    fn stdout_push(&mut self, end: char) {
        let mut stdout = io::stdout().lock();
        let mut buf = [0u8; 4];
        let _ = stdout.write_all(end.encode_utf8(&mut buf).as_bytes());
        let _ = stdout.flush();
    }
}

/// A `PrintWriter` that collects all output into a string.
///
/// Useful for testing or capturing print output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    /// Creates a new empty `CollectStringPrint`.
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Returns the collected output as a string slice.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        self.0.push_str(&output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// `PrintWriter` that ignores all output.
///
/// Useful for suppressing print output during testing or benchmarking.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: Cow<'_, str>) {}

    fn stdout_push(&mut self, _end: char) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_string_print_accumulates() {
        let mut print = CollectStringPrint::new();
        print.stdout_write(Cow::Borrowed("hello"));
        print.stdout_push('\n');
        print.stdout_write(Cow::Owned("42".to_string()));
        assert_eq!(print.output(), "hello\n42");
    }

    #[test]
    fn no_print_discards_everything() {
        let mut print = NoPrint;
        print.stdout_write(Cow::Borrowed("dropped"));
        print.stdout_push('\n');
    }
}
