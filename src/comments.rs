//! Sink for messages meant for the humans reviewing a flow.
//!
//! Non-automatic conflict resolutions are reported here instead of failing
//! the flow; the caller decides where the comments end up (a PR, the console).

use std::sync::Mutex;

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentSeverity {
    Information,
    Warning,
    Caution,
}

pub trait CommentCollector: Send + Sync {
    fn add_comment(&self, text: &str, severity: CommentSeverity);
}

/// Keeps comments in memory and mirrors them to the log.
#[derive(Debug, Default)]
pub struct CommentLog {
    comments: Mutex<Vec<(String, CommentSeverity)>>,
}

impl CommentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comments(&self) -> Vec<(String, CommentSeverity)> {
        self.comments
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl CommentCollector for CommentLog {
    fn add_comment(&self, text: &str, severity: CommentSeverity) {
        match severity {
            CommentSeverity::Information => info!("{}", text),
            CommentSeverity::Warning | CommentSeverity::Caution => warn!("{}", text),
        }
        if let Ok(mut comments) = self.comments.lock() {
            comments.push((text.to_string(), severity));
        }
    }
}
