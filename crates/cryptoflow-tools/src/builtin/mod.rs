pub mod crypto;
pub mod indicators;
pub mod notification;
pub mod web_search;

pub use crypto::{CryptoNewsTool, CryptoPriceTool};
pub use indicators::IndicatorTool;
pub use notification::NotificationTool;
pub use web_search::WebSearchTool;
