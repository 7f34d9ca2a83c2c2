use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

pub const CHAT_SOURCE_TAG: &str = "CHAT";
const ESCAPED_NEWLINE_ARTIFACT: &str = "\\n";

lazy_static! {
    static ref LOG_LINE_PATTERN: Regex = Regex::new(concat!(
        r"^\[(?P<clock>\d{2}:\d{2}:\d{2})\] ",
        r"\[(?P<thread>.+?)/(?P<level>[A-Z]+)\]:",
        r"(?: \[(?P<source>[^\]]+)\])?",
        r" ?(?P<body>.*)$",
    ))
    .expect("log line pattern is a valid regex");
}

/// One decoded client log line.
///
/// Lines that do not follow `[HH:MM:SS] [thread/LEVEL]: [SOURCE] body` are kept
/// as a pass-through record: the raw text becomes the body and every tag is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub raw_line: String,
    pub clock_time: Option<String>,
    pub thread_name: Option<String>,
    pub level: Option<String>,
    pub source: Option<String>,
    pub body: String,
    pub is_chat: bool,
    pub chat_message: Option<String>,
}

impl LogLine {
    pub fn passthrough(raw_line: &str) -> Self {
        Self {
            raw_line: raw_line.to_string(),
            clock_time: None,
            thread_name: None,
            level: None,
            source: None,
            body: raw_line.to_string(),
            is_chat: false,
            chat_message: None,
        }
    }

    pub fn trimmed_body(&self) -> &str {
        self.body.trim()
    }
}

pub fn decode_log_line(raw_line: &str) -> LogLine {
    let Some(captures) = LOG_LINE_PATTERN.captures(raw_line) else {
        return LogLine::passthrough(raw_line);
    };

    let capture_text = |name: &str| captures.name(name).map(|value| value.as_str().to_string());

    let body = capture_text("body").unwrap_or_default();
    let source = capture_text("source");
    let is_chat = source.as_deref() == Some(CHAT_SOURCE_TAG);
    let chat_message = is_chat.then(|| normalize_chat_message(&body));

    LogLine {
        raw_line: raw_line.to_string(),
        clock_time: capture_text("clock"),
        thread_name: capture_text("thread"),
        level: capture_text("level"),
        source,
        body,
        is_chat,
        chat_message,
    }
}

pub fn normalize_chat_message(message: &str) -> String {
    let cleaned = message.trim();
    match cleaned.strip_prefix(ESCAPED_NEWLINE_ARTIFACT) {
        Some(rest) => rest.trim().to_string(),
        None => cleaned.to_string(),
    }
}
