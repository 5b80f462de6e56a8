//! Small string helpers shared by the providers and the front end.

/// Longest backend error body excerpt that reaches the logs.
const ERROR_EXCERPT_CHARS: usize = 200;

/// Keep at most `max_chars` characters, appending "..." when something was cut.
///
/// Cuts on character boundaries, so multi-byte text never panics.
///
/// ```
/// use paintbot::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Single-line, bounded excerpt of an HTTP error body for logs and errors.
///
/// Python tracebacks from the image server can run to hundreds of lines.
pub fn error_excerpt(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return "<empty body>".into();
    }
    truncate_with_ellipsis(&flat, ERROR_EXCERPT_CHARS)
}
