//! Emoji used by the terminal reporter, with plain fallbacks for terminals
//! that cannot render them.

use console::Emoji;

// Status
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static THINKING: Emoji<'_, '_> = Emoji("💭 ", "..");

// Files and packages
pub static FILE_NEW: Emoji<'_, '_> = Emoji("📄 ", "+");
pub static FILE_CUT: Emoji<'_, '_> = Emoji("✂️  ", "~");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "[PKG]");

// Sandbox
pub static SANDBOX: Emoji<'_, '_> = Emoji("🧪 ", "[SBX]");
pub static PREVIEW: Emoji<'_, '_> = Emoji("🌐 ", "[URL]");
