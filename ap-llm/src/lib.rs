//! Provider wire clients for the autopilot engine.
//!
//! Pure HTTP callers: a message list goes in, a reply string comes out.
//! Admission control, fallback and credit accounting live in `ap-core`.

mod error;
mod gemini;
mod openai;
mod transport;
mod types;

pub use error::{LlmError, Result};
pub use gemini::{GEMINI_DEFAULT_ENDPOINT, GeminiClient};
pub use openai::{OPENAI_DEFAULT_ENDPOINT, OpenAiClient};
pub use transport::{HttpTransport, Transport};
pub use types::{ChatMessage, ChatResponse, ReplyMode, Role, Usage};
