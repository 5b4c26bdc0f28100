// Embeddings module
// Provider-backed vector generation and token budgeting

pub mod generator;
pub mod tokens;

pub use generator::{Embedder, EmbeddingGenerator};
pub use tokens::{estimate_token_count, truncate_to_token_budget};
