//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Session indicators
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static CHECKPOINT: Emoji<'_, '_> = Emoji("⏸️  ", "[CP]");
pub static REGRESSION: Emoji<'_, '_> = Emoji("🧪 ", "[TEST]");
pub static WARNING: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
