pub mod client;
pub mod error;
pub mod types;

pub use client::AnthropicClient;
pub use error::AnthropicError;
pub use types::{ContentPart, Message, MessagesRequest, MessagesResponse, Usage};
