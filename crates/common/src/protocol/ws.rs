// WebSocket message types for the collaboration hub protocol.
//
// Every frame is a single JSON object carrying a `type` discriminator.
// Field names are camelCase on the wire to match the browser client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of characters kept from a chat note.
pub const CHAT_MAX_CHARS: usize = 500;

/// Presence status a client reports for itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Online,
    Idle,
    Offline,
}

impl PresenceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Info,
    Warning,
}

/// What a viewer is doing on a canvas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CanvasPresenceAction {
    Viewing,
    Editing,
    Left,
}

/// Outcome of a frame lock transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CanvasLockAction {
    Acquired,
    Denied,
    Released,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockRequestAction {
    Acquire,
    Release,
}

fn default_is_typing() -> bool {
    true
}

/// Client -> Server messages.
///
/// Unknown `type` values and malformed payloads fail to deserialize; the hub
/// treats that as protocol noise and drops the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Free-text note shown to the rest of the workspace.
    #[serde(rename_all = "camelCase")]
    Chat {
        #[serde(default)]
        text: String,
    },

    /// Liveness ping. Identity fields are accepted but never trusted.
    #[serde(rename_all = "camelCase")]
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Presence { status: PresenceStatus },

    #[serde(rename_all = "camelCase")]
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default = "default_is_typing")]
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    CanvasJoin { canvas_id: String },

    #[serde(rename_all = "camelCase")]
    CanvasLeave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        canvas_id: Option<String>,
    },

    /// Focus a frame on the current canvas; `null` clears the focus.
    #[serde(rename_all = "camelCase")]
    CanvasFrameFocus {
        #[serde(default)]
        frame_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    CanvasLockRequest { action: LockRequestAction, frame_id: String },
}

impl ClientMessage {
    /// Wire name of the message type, used for logging and metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Hello { .. } => "hello",
            Self::Presence { .. } => "presence",
            Self::Typing { .. } => "typing",
            Self::CanvasJoin { .. } => "canvas_join",
            Self::CanvasLeave { .. } => "canvas_leave",
            Self::CanvasFrameFocus { .. } => "canvas_frame_focus",
            Self::CanvasLockRequest { .. } => "canvas_lock_request",
        }
    }
}

/// Server -> Client messages originated by the hub itself.
///
/// Business events injected by collaborators (`comment`, `version`, ...) are
/// relayed verbatim as raw JSON and are not modelled here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: Option<String>,
        display_name: String,
        status: PresenceStatus,
        at: DateTime<Utc>,
    },

    System { level: SystemLevel, message: String },

    #[serde(rename_all = "camelCase")]
    Typing {
        user_id: Option<String>,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        is_typing: bool,
        at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    CanvasPresence {
        action: CanvasPresenceAction,
        canvas_id: String,
        user_id: Option<String>,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    CanvasLock {
        action: CanvasLockAction,
        canvas_id: String,
        frame_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acquired_at: Option<DateTime<Utc>>,
    },
}

/// Trim a chat note and cap it at [`CHAT_MAX_CHARS`] characters.
///
/// Returns `None` when nothing is left after trimming.
pub fn normalize_chat_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    Some(trimmed.chars().take(CHAT_MAX_CHARS).collect())
}
