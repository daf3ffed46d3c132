//! Shared SSE line-draining helpers used by every adapter's
//! `generate_stream` implementation, grounded in the forwarding layer's
//! SSE parsing utilities.

/// Split a buffer of freshly-received bytes on newlines, returning
/// complete lines and leaving any trailing partial line in `buf` for the
/// next call.
pub fn drain_sse_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.find('\n') {
        let line = buf[..pos].trim_end_matches('\r').to_string();
        lines.push(line);
        buf.drain(..=pos);
    }
    lines
}

/// Extract the payload of an SSE `data: ...` line, if this line is one.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
}

/// True if this SSE data payload signals stream completion.
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_lines_and_keeps_partial() {
        let mut buf = String::from("data: one\ndata: two\ndata: th");
        let lines = drain_sse_lines(&mut buf);
        assert_eq!(lines, vec!["data: one", "data: two"]);
        assert_eq!(buf, "data: th");
    }

    #[test]
    fn parses_data_payload() {
        assert_eq!(parse_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("event: ping"), None);
    }

    #[test]
    fn recognizes_done_sentinel() {
        assert!(is_sse_done("[DONE]"));
        assert!(is_sse_done(" [DONE] "));
        assert!(!is_sse_done("{\"text\":\"hi\"}"));
    }
}
