//! Progress extraction from the translation worker's stdout.
//!
//! The worker is an opaque program printing free-form text. Only the
//! markers below carry meaning; everything else yields `None` and is
//! only logged by the caller. Rules are tried in order, first match wins:
//!
//! | marker                              | percent | message                          |
//! |-------------------------------------|---------|----------------------------------|
//! | `✅ ... Created: <file>`            | 100     | `Translation completed: <file>`  |
//! | `PROGRESS: <n>% - <text>`           | n       | `<text>`                         |
//! | `Processing: <item>`                | unknown | `Processing: <item>`             |
//! | `Processed <k> images`              | unknown | `Processed <k> images`           |
//! | `⚙️ Device: ...`                    | 0       | `Initializing...`                |
//! | `✅ Pipeline Ready`                 | 5       | `AI pipeline ready`              |
//! | `❌ <text>`                         | unknown | `Error: <text>`                  |

use std::sync::LazyLock;

use regex::Regex;

/// Highest percentage the parser ever reports.
pub const MAX_PERCENT: u8 = 100;

/// Milestone reported when the worker announces its compute device.
pub const INIT_PERCENT: u8 = 0;

/// Milestone reported once the worker's pipeline is loaded.
pub const READY_PERCENT: u8 = 5;

static COMPLETED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Created:\s+(.+)").expect("valid regex"));

static EXPLICIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PROGRESS:\s+(\d+)%\s+-\s+(.+)").expect("valid regex"));

static PROCESSING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Processing:\s+(.+)").expect("valid regex"));

static PROCESSED_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+images?").expect("valid regex"));

static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"❌\s+(.+)").expect("valid regex"));

/// Information extracted from one line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    /// `None` when the line carries a message but no usable percentage.
    pub percent: Option<u8>,
    pub message: String,
}

impl ProgressLine {
    fn known(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: Some(percent),
            message: message.into(),
        }
    }

    fn unknown(message: impl Into<String>) -> Self {
        Self {
            percent: None,
            message: message.into(),
        }
    }
}

/// Parse one line of worker stdout.
pub fn parse_line(line: &str) -> Option<ProgressLine> {
    if line.contains('✅') {
        if let Some(caps) = COMPLETED_RE.captures(line) {
            let artifact = caps[1].trim();
            return Some(ProgressLine::known(
                MAX_PERCENT,
                format!("Translation completed: {artifact}"),
            ));
        }
    }

    if let Some(caps) = EXPLICIT_RE.captures(line) {
        // Values that overflow u32 fall through to the heuristics below.
        if let Ok(n) = caps[1].parse::<u32>() {
            let percent = n.min(u32::from(MAX_PERCENT)) as u8;
            return Some(ProgressLine::known(percent, caps[2].trim()));
        }
    }

    if let Some(caps) = PROCESSING_RE.captures(line) {
        let item = caps[1].trim();
        if !item.is_empty() {
            return Some(ProgressLine::unknown(format!("Processing: {item}")));
        }
    }

    if line.contains("Processed") {
        if let Some(caps) = PROCESSED_COUNT_RE.captures(line) {
            return Some(ProgressLine::unknown(format!("Processed {} images", &caps[1])));
        }
    }

    if line.contains('⚙') && line.contains("Device:") {
        return Some(ProgressLine::known(INIT_PERCENT, "Initializing..."));
    }

    if line.contains("✅ Pipeline Ready") {
        return Some(ProgressLine::known(READY_PERCENT, "AI pipeline ready"));
    }

    if let Some(caps) = ERROR_RE.captures(line) {
        let text = caps[1].trim();
        if !text.is_empty() {
            return Some(ProgressLine::unknown(format!("Error: {text}")));
        }
    }

    None
}
