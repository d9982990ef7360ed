//! Vibe-lane embeddings
//!
//! The chunking policy, the deterministic mel-stats model, and the chunk
//! vector store. Ingestion and query both go through [`ChunkPolicy`] and
//! [`shared_model`] so stored and query vectors stay comparable.

pub mod chunker;
pub mod model;
pub mod store;

pub use chunker::{AudioChunk, ChunkPolicy};
pub use model::{shared_model, EmbeddingModel, MelBandModel, EMBEDDING_DIM, MODEL_NAME};
pub use store::{ChunkEmbedding, ChunkHit, SqliteVectorStore, VectorStore};
