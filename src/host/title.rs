//! OSC 0/2 terminal-title extraction.
//!
//! We don't run a full terminal emulator server-side — only `vte`'s
//! escape-sequence parser, with a `Perform` that reacts to OSC 0 ("icon name
//! and window title") and OSC 2 ("window title") and ignores everything
//! else. All bytes, matched or not, still go to the scrollback and the mux
//! fan-out unchanged; this is a read-only tap on the stream.

use vte::{Parser, Perform};

#[derive(Default)]
struct TitleSink {
    latest: Option<String>,
}

impl Perform for TitleSink {
    fn print(&mut self, _c: char) {}
    fn execute(&mut self, _byte: u8) {}
    fn hook(&mut self, _params: &vte::Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        if params.len() < 2 {
            return;
        }
        let is_title = matches!(params[0], b"0" | b"2");
        if !is_title {
            return;
        }
        self.latest = Some(String::from_utf8_lossy(params[1]).into_owned());
    }

    fn csi_dispatch(
        &mut self,
        _params: &vte::Params,
        _intermediates: &[u8],
        _ignore: bool,
        _action: char,
    ) {
    }
    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

/// Stateful extractor: feed it PTY output chunks in order, it remembers VTE
/// parser state (e.g. a split OSC sequence) across calls.
pub struct TitleExtractor {
    parser: Parser,
    sink: TitleSink,
}

impl Default for TitleExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl TitleExtractor {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            sink: TitleSink::default(),
        }
    }

    /// Feed a chunk of raw PTY output. Returns `Some(title)` if this chunk
    /// completed a title-setting OSC sequence, else `None`.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<String> {
        self.sink.latest = None;
        for &b in bytes {
            self.parser.advance(&mut self.sink, b);
        }
        self.sink.latest.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osc_0_sets_title() {
        let mut ex = TitleExtractor::new();
        let title = ex.feed(b"\x1b]0;my-session\x07");
        assert_eq!(title.as_deref(), Some("my-session"));
    }

    #[test]
    fn osc_2_sets_title() {
        let mut ex = TitleExtractor::new();
        let title = ex.feed(b"\x1b]2;vim ~/file.rs\x07");
        assert_eq!(title.as_deref(), Some("vim ~/file.rs"));
    }

    #[test]
    fn osc_1_icon_name_only_is_ignored() {
        let mut ex = TitleExtractor::new();
        let title = ex.feed(b"\x1b]1;icon-only\x07");
        assert_eq!(title, None);
    }

    #[test]
    fn plain_text_produces_no_title() {
        let mut ex = TitleExtractor::new();
        let title = ex.feed(b"hello world\r\n");
        assert_eq!(title, None);
    }

    #[test]
    fn split_sequence_across_two_feeds_is_detected() {
        let mut ex = TitleExtractor::new();
        assert_eq!(ex.feed(b"\x1b]0;par"), None);
        let title = ex.feed(b"tial\x07");
        assert_eq!(title.as_deref(), Some("partial"));
    }

    #[test]
    fn st_terminated_osc_is_also_recognized() {
        let mut ex = TitleExtractor::new();
        let title = ex.feed(b"\x1b]2;st-terminated\x1b\\");
        assert_eq!(title.as_deref(), Some("st-terminated"));
    }
}
