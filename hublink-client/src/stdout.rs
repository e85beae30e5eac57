//! Buffered hub stdout and traceback extraction.
//!
//! A traceback is usually split across several notification frames, so the
//! buffer is only scanned once output goes quiet (or a status report forces
//! a flush). The accumulator itself is a plain value; the dispatcher owns
//! the timing.

const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// Append-only stdout buffer with a generation counter. Every append bumps
/// the generation, so a debounce timer armed for an older generation knows
/// it has been superseded. `take` also bumps it, which atomically
/// invalidates any pending timer along with clearing the buffer.
#[derive(Debug, Default)]
pub(crate) struct StdoutAccumulator {
    buffer: String,
    generation: u64,
}

impl StdoutAccumulator {
    /// Append text and return the new generation.
    pub(crate) fn append(&mut self, text: &str) -> u64 {
        self.buffer.push_str(text);
        self.generation += 1;
        self.generation
    }

    /// True if nothing has been appended or taken since `generation`.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Clear the buffer and return its contents.
    pub(crate) fn take(&mut self) -> String {
        self.generation += 1;
        std::mem::take(&mut self.buffer)
    }
}

/// A Python error reconstructed from hub output. `line` is zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

/// Scan buffered output for a traceback block:
///
/// ```text
/// Traceback (most recent call last):
///   File "__main__.py", line 9, in <module>
///   File "test1.py", line 9, in <module>
/// NameError: name 'PrimeHub2' isn't defined
/// ```
///
/// The reported location is the last (most specific) stack frame. Returns
/// `None` for anything incomplete - a truncated traceback usually means the
/// rest is still in flight.
pub fn extract_traceback(text: &str) -> Option<PythonError> {
    let lines: Vec<&str> = text.lines().collect();
    let marker = lines.iter().position(|l| l.starts_with(TRACEBACK_MARKER))?;

    let mut end = marker + 1;
    let mut last_frame = None;
    while end < lines.len() {
        match parse_frame_line(lines[end]) {
            Some(frame) => {
                last_frame = Some(frame);
                end += 1;
            }
            None => break,
        }
    }
    while end < lines.len() && lines[end].trim().is_empty() {
        end += 1;
    }

    let message = lines.get(end)?.trim();
    if message.is_empty() {
        return None;
    }
    let (file, line) = last_frame?;

    Some(PythonError {
        file,
        line: line.saturating_sub(1),
        message: message.to_string(),
    })
}

/// Parse one stack frame line: `  File "<path>", line <N>, in <context>`.
/// The line must be indented and the 1-based line number is returned as-is.
fn parse_frame_line(line: &str) -> Option<(String, u32)> {
    if !line.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = line.trim_start().strip_prefix("File \"")?;
    let (file, rest) = rest.split_once('"')?;
    let rest = rest.strip_prefix(", line ")?;
    let (number, rest) = rest.split_once(',')?;
    let line_no: u32 = number.trim().parse().ok()?;
    if rest.trim_start().strip_prefix("in ")?.is_empty() {
        return None;
    }
    Some((file.to_string(), line_no))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_take_invalidates_pending_generation() {
        let mut acc = StdoutAccumulator::default();
        let first = acc.append("hello");
        assert!(acc.is_current(first));
        let second = acc.append(" world");
        assert!(!acc.is_current(first));
        assert_eq!(acc.take(), "hello world");
        assert!(!acc.is_current(second));
        assert_eq!(acc.take(), "");
    }

    #[test]
    fn extracts_single_frame_traceback() {
        let text = "...\nTraceback (most recent call last):\n  File \"main.py\", line 10, in <module>\nNameError: x\n";
        assert_eq!(
            extract_traceback(text),
            Some(PythonError {
                file: "main.py".to_string(),
                line: 9,
                message: "NameError: x".to_string(),
            })
        );
    }

    #[test]
    fn reports_last_frame_of_nested_traceback() {
        let text = "Traceback (most recent call last):\n  File \"__main__.py\", line 9, in <module>\n  File \"test1.py\", line 3, in helper\nNameError: name 'PrimeHub2' isn't defined\n";
        let err = extract_traceback(text).unwrap();
        assert_eq!(err.file, "test1.py");
        assert_eq!(err.line, 2);
        assert_eq!(err.message, "NameError: name 'PrimeHub2' isn't defined");
    }

    #[test]
    fn skips_blank_lines_before_message() {
        let text = "Traceback (most recent call last):\n  File \"main.py\", line 1, in <module>\n\n  \nValueError: bad\n";
        let err = extract_traceback(text).unwrap();
        assert_eq!(err.message, "ValueError: bad");
    }

    #[test]
    fn no_marker_means_no_error() {
        assert_eq!(extract_traceback("plain output\nnothing to see\n"), None);
    }

    #[test]
    fn marker_without_frames_is_discarded() {
        assert_eq!(extract_traceback("Traceback (most recent call last):\n"), None);
        // message but no frame line: filename is required
        assert_eq!(
            extract_traceback("Traceback (most recent call last):\nNameError: x\n"),
            None
        );
    }

    #[test]
    fn truncated_traceback_is_discarded() {
        let text = "Traceback (most recent call last):\n  File \"main.py\", line 10, in <module>\n";
        assert_eq!(extract_traceback(text), None);
    }

    #[test]
    fn frame_line_must_be_indented() {
        assert!(parse_frame_line("File \"main.py\", line 10, in <module>").is_none());
        assert_eq!(
            parse_frame_line("  File \"main.py\", line 10, in <module>"),
            Some(("main.py".to_string(), 10))
        );
    }
}
