//! Pre-admission checks: files that fail these never enter the registry.

use serde::Serialize;
use thiserror::Error;

use crate::format::format_bytes;
use crate::task::UploadFile;

/// Why a file was refused at enqueue time.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectReason {
    #[error("file is {} but the limit is {}", size_label(.size), size_label(.limit))]
    TooLarge { size: u64, limit: u64 },

    #[error("file type {mime_type} is not accepted (allowed: {pattern})")]
    TypeNotAccepted { mime_type: String, pattern: String },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn size_label(bytes: &u64) -> String {
    format_bytes(*bytes)
}

/// A file refused at enqueue time, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Name of the refused file.
    pub name: String,
    /// Why it was refused.
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AcceptRule {
    Extension(String),
    MimeType(String),
    MimePrefix(String),
}

/// Parsed HTML-style `accept` list, e.g. `"image/*,.pdf,application/zip"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptPattern {
    source: String,
    rules: Vec<AcceptRule>,
}

impl AcceptPattern {
    /// Parses a comma-separated accept list. Empty entries are ignored; an
    /// empty list, `*` or `*/*` accepts everything.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let mut rules = Vec::new();
        for entry in pattern.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let entry = entry.to_ascii_lowercase();
            if entry == "*" || entry == "*/*" {
                rules.clear();
                return Self {
                    source: pattern.to_string(),
                    rules,
                };
            }
            let rule = if let Some(ext) = entry.strip_prefix('.') {
                AcceptRule::Extension(ext.to_string())
            } else if let Some(prefix) = entry.strip_suffix("/*") {
                AcceptRule::MimePrefix(format!("{prefix}/"))
            } else {
                AcceptRule::MimeType(entry)
            };
            rules.push(rule);
        }
        Self {
            source: pattern.to_string(),
            rules,
        }
    }

    /// Returns true if a file with this name and MIME type is allowed.
    #[must_use]
    pub fn accepts(&self, name: &str, mime_type: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let name = name.to_ascii_lowercase();
        let mime = mime_type.to_ascii_lowercase();
        self.rules.iter().any(|rule| match rule {
            AcceptRule::Extension(ext) => name
                .rsplit_once('.')
                .is_some_and(|(_, file_ext)| file_ext == ext),
            AcceptRule::MimeType(m) => &mime == m,
            AcceptRule::MimePrefix(prefix) => mime.starts_with(prefix.as_str()),
        })
    }

    /// The pattern as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Checks applied to every file before it is queued.
#[derive(Debug, Clone, Default)]
pub struct FileValidator {
    accept: Option<AcceptPattern>,
    max_file_size: Option<u64>,
}

impl FileValidator {
    /// Creates a validator; `None` disables the corresponding check.
    #[must_use]
    pub fn new(accept: Option<&str>, max_file_size: Option<u64>) -> Self {
        Self {
            accept: accept.map(AcceptPattern::parse),
            max_file_size,
        }
    }

    /// Validates one file.
    ///
    /// # Errors
    ///
    /// Returns the first rule the file breaks.
    pub fn validate(&self, file: &UploadFile) -> Result<(), RejectReason> {
        if let Some(limit) = self.max_file_size {
            let size = file.size_bytes();
            if size > limit {
                return Err(RejectReason::TooLarge { size, limit });
            }
        }
        if let Some(accept) = &self.accept
            && !accept.accepts(&file.name, &file.mime_type)
        {
            return Err(RejectReason::TypeNotAccepted {
                mime_type: file.mime_type.clone(),
                pattern: accept.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Splits `files` into accepted files and rejections, keeping order.
    #[must_use]
    pub fn partition(&self, files: Vec<UploadFile>) -> (Vec<UploadFile>, Vec<Rejection>) {
        let mut accepted = Vec::with_capacity(files.len());
        let mut rejected = Vec::new();
        for file in files {
            match self.validate(&file) {
                Ok(()) => accepted.push(file),
                Err(reason) => rejected.push(Rejection {
                    name: file.name,
                    reason,
                }),
            }
        }
        (accepted, rejected)
    }
}
