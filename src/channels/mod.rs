//! Outbound delivery channels.

pub mod content;
pub mod notifier;
pub mod telegram;

pub use content::ContentCatalog;
pub use notifier::Notifier;
pub use telegram::TelegramNotifier;
