//! Agent-id capture from the PTY output stream.
//!
//! When a task runs, the Agent CLI announces the session identifier it
//! assigned itself somewhere early in its output. The filter here is a pure
//! observer on the byte stream: bytes are forwarded untouched by the caller,
//! while a rolling window of recent output is matched (after ANSI stripping)
//! against the configured announcement patterns. The window absorbs ids that
//! arrive split across read chunks.

use regex::Regex;

/// Rolling-window size. Large enough to hold an announcement split across
/// several 4 KiB reads plus surrounding escape sequences.
const WINDOW_CAP: usize = 1024;

/// One-shot scanner for the Agent's self-assigned session id.
pub struct IdCaptureFilter {
    window: Vec<u8>,
    patterns: Vec<Regex>,
    captured: Option<String>,
}

impl IdCaptureFilter {
    /// Compiles `patterns` (group 1 must be the id). Invalid patterns are
    /// logged and skipped; with none left the filter never captures and the
    /// task falls back to the completion marker.
    pub fn new(patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("Skipping invalid capture pattern {p:?}: {e}");
                    None
                }
            })
            .collect();
        Self {
            window: Vec::with_capacity(WINDOW_CAP),
            patterns: compiled,
            captured: None,
        }
    }

    /// Observes one output chunk. Returns the id the first time an
    /// announcement is recognized, `None` on every other call. After capture
    /// this is a constant-time no-op.
    pub fn scan(&mut self, chunk: &[u8]) -> Option<String> {
        if self.captured.is_some() {
            return None;
        }
        self.window.extend_from_slice(chunk);
        if self.window.len() > WINDOW_CAP {
            let excess = self.window.len() - WINDOW_CAP;
            self.window.drain(..excess);
        }

        // Match against a plain-text view; the forwarded stream keeps its
        // escape sequences.
        let plain = strip_ansi_escapes::strip(&self.window);
        let text = String::from_utf8_lossy(&plain);
        for re in &self.patterns {
            if let Some(caps) = re.captures(&text) {
                if let Some(m) = caps.get(1) {
                    let id = m.as_str().to_string();
                    self.captured = Some(id.clone());
                    self.window = Vec::new();
                    return Some(id);
                }
            }
        }
        None
    }

    pub fn captured(&self) -> Option<&str> {
        self.captured.as_deref()
    }
}

/// Detects `http(s)` URLs the Agent prints for the user to open (OAuth and
/// similar flows). Same rolling-window approach as the id filter, but
/// repeatable: each *distinct* URL is reported once.
pub struct UrlScanner {
    window: Vec<u8>,
    pattern: Regex,
    last_reported: Option<String>,
}

impl Default for UrlScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlScanner {
    pub fn new() -> Self {
        Self {
            window: Vec::with_capacity(WINDOW_CAP),
            pattern: Regex::new(r#"https?://[^\s"'<>`\x1b\x07]+"#).expect("static pattern"),
            last_reported: None,
        }
    }

    /// Observes one output chunk; returns a URL the first time it is seen.
    pub fn scan(&mut self, chunk: &[u8]) -> Option<String> {
        self.window.extend_from_slice(chunk);
        if self.window.len() > WINDOW_CAP {
            let excess = self.window.len() - WINDOW_CAP;
            self.window.drain(..excess);
        }
        let plain = strip_ansi_escapes::strip(&self.window);
        let text = String::from_utf8_lossy(&plain);

        let m = self.pattern.find_iter(&text).last()?;
        if m.end() == text.len() {
            // The URL may continue in the next chunk; wait for a delimiter.
            return None;
        }
        let raw = m.as_str();
        // Terminal output tends to glue punctuation onto the URL.
        let trimmed = raw.trim_end_matches(['.', ',', ';', ')', ']']);
        if url::Url::parse(trimmed).is_err() {
            return None;
        }
        if self.last_reported.as_deref() == Some(trimmed) {
            return None;
        }
        self.last_reported = Some(trimmed.to_string());
        self.last_reported.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_capture_patterns;

    const ID: &str = "8a2f04c6-1b2c-4d5e-8f90-abcdef012345";

    fn filter() -> IdCaptureFilter {
        IdCaptureFilter::new(&default_capture_patterns())
    }

    #[test]
    fn captures_announced_id() {
        let mut f = filter();
        let got = f.scan(format!("Welcome!\r\nSession: {ID}\r\n").as_bytes());
        assert_eq!(got.as_deref(), Some(ID));
        assert_eq!(f.captured(), Some(ID));
    }

    #[test]
    fn captures_json_announcement() {
        let mut f = filter();
        let got = f.scan(format!(r#"{{"type":"system","session_id":"{ID}"}}"#).as_bytes());
        assert_eq!(got.as_deref(), Some(ID));
    }

    #[test]
    fn captures_id_split_across_chunks() {
        let mut f = filter();
        let line = format!("Session: {ID}");
        let (a, b) = line.as_bytes().split_at(line.len() / 2);
        assert_eq!(f.scan(a), None);
        assert_eq!(f.scan(b).as_deref(), Some(ID));
    }

    #[test]
    fn captures_through_embedded_ansi() {
        let mut f = filter();
        let chunk = format!("\x1b[1mSession:\x1b[0m \x1b[36m{ID}\x1b[0m\r\n");
        assert_eq!(f.scan(chunk.as_bytes()).as_deref(), Some(ID));
    }

    #[test]
    fn ignores_unannounced_uuid() {
        let mut f = filter();
        assert_eq!(f.scan(format!("checksum {ID} verified\n").as_bytes()), None);
        assert_eq!(f.captured(), None);
        // The announced one still wins afterwards.
        let other = "0f0f0f0f-0000-4000-8000-000000000000";
        assert_eq!(
            f.scan(format!("Session: {other}\n").as_bytes()).as_deref(),
            Some(other)
        );
    }

    #[test]
    fn captures_at_most_once() {
        let mut f = filter();
        assert!(f.scan(format!("Session: {ID}\n").as_bytes()).is_some());
        let other = "0f0f0f0f-0000-4000-8000-000000000000";
        assert_eq!(f.scan(format!("Session: {other}\n").as_bytes()), None);
        assert_eq!(f.captured(), Some(ID));
    }

    #[test]
    fn old_candidates_scroll_out_of_the_window() {
        let mut f = filter();
        // Push the announcement prefix out of the window with filler, then
        // complete it: no capture, the context is gone.
        assert_eq!(f.scan(b"Session: "), None);
        assert_eq!(f.scan(&vec![b'x'; WINDOW_CAP * 2]), None);
        assert_eq!(f.scan(ID.as_bytes()), None);
    }

    #[test]
    fn url_scanner_reports_each_url_once() {
        let mut s = UrlScanner::new();
        assert_eq!(
            s.scan(b"Open https://example.com/auth?code=1 to continue\n"),
            Some("https://example.com/auth?code=1".to_string())
        );
        assert_eq!(s.scan(b"still waiting...\n"), None);
        assert_eq!(
            s.scan(b"or visit https://example.com/done\n"),
            Some("https://example.com/done".to_string())
        );
    }

    #[test]
    fn url_scanner_handles_split_and_ansi() {
        let mut s = UrlScanner::new();
        assert_eq!(s.scan(b"\x1b[4mhttps://exam"), None);
        let got = s.scan(b"ple.com/login\x1b[0m\n");
        assert_eq!(got, Some("https://example.com/login".to_string()));
    }
}
