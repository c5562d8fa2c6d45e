//! Domain types for user activity signals.

use serde::Deserialize;
use serde::Serialize;

/// A qualifying interaction signal.
///
/// Any occurrence of one of these, regardless of target or payload, counts
/// as user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    #[serde(alias = "touch-start")]
    TouchStart,
    Click,
    #[serde(alias = "key-press", alias = "keydown")]
    KeyPress,
    Scroll,
    #[serde(alias = "mousemove", alias = "pointer-move")]
    PointerMove,
}

/// Every signal the idle monitor subscribes to, in registration order.
pub const ACTIVITY_KINDS: [ActivityKind; 5] = [
    ActivityKind::TouchStart,
    ActivityKind::Click,
    ActivityKind::KeyPress,
    ActivityKind::Scroll,
    ActivityKind::PointerMove,
];

impl ActivityKind {
    /// Get the DOM event name for this signal.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TouchStart => "touchstart",
            Self::Click => "click",
            Self::KeyPress => "keypress",
            Self::Scroll => "scroll",
            Self::PointerMove => "pointermove",
        }
    }

    /// Parse an event name, accepting DOM names and a few common aliases.
    ///
    /// Matching is case-insensitive. Returns `None` for anything that is not
    /// a qualifying signal.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "touchstart" | "touch-start" => Some(Self::TouchStart),
            "click" => Some(Self::Click),
            "keypress" | "key-press" | "keydown" => Some(Self::KeyPress),
            "scroll" => Some(Self::Scroll),
            "pointermove" | "pointer-move" | "mousemove" => Some(Self::PointerMove),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
