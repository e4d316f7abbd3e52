//! Declared kind of an uploaded file.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Upload extensions accepted as a single page.
pub const IMAGE_UPLOAD_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Upload extension accepted as a multi-page archive.
pub const ARCHIVE_UPLOAD_EXTENSION: &str = "zip";

/// What the user submitted: one page, or an archive of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    #[serde(alias = "zip")]
    Archive,
}

impl FileKind {
    /// Database / wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Archive => "archive",
        }
    }

    /// Classify an upload by its filename extension (case-insensitive).
    ///
    /// Returns `None` for unsupported extensions.
    pub fn classify(filename: &str) -> Option<Self> {
        let ext = Path::new(filename)
            .extension()?
            .to_str()?
            .to_ascii_lowercase();

        if IMAGE_UPLOAD_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if ext == ARCHIVE_UPLOAD_EXTENSION {
            Some(Self::Archive)
        } else {
            None
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "archive" | "zip" => Ok(Self::Archive),
            other => Err(CoreError::Validation(format!("Unknown file kind: {other}"))),
        }
    }
}
