//! Asynchronous conditions reported to the plugin manager.

use tokio::sync::mpsc;

/// Something the plugin manager must react to outside a direct call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The isolate behind sandbox `instance` exited or its channel broke.
    Terminated {
        plugin_id: String,
        instance: u64,
        reason: String,
    },
    /// The plugin exceeded the error threshold within the boundary window.
    FailureStorm { plugin_id: String, errors: usize },
}

impl Notice {
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Terminated { plugin_id, .. } | Self::FailureStorm { plugin_id, .. } => plugin_id,
        }
    }
}

pub type NoticeSender = mpsc::UnboundedSender<Notice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}
