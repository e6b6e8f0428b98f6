//! External API integrations

pub mod generative;

pub use generative::{GeminiClient, GenerationError, GenerationOutput, TextGenerator};
