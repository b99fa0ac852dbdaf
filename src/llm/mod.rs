#[cfg(feature = "gemini")]
pub mod client;
pub mod parse;
pub mod prompts;
pub mod types;

#[cfg(feature = "gemini")]
pub use client::*;
pub use parse::*;
pub use types::*;
