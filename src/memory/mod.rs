//! 记忆层：短期（情节条目，共享向量库）与长期（定期反思得到的摘要）

pub mod agent_memory;
pub mod factory;
pub mod item;
pub mod persistence;
pub mod store;

pub use agent_memory::Memory;
pub use factory::{InsertAck, MemoryFactory, Reflection, NEVER_REFLECTED};
pub use item::{MemoryItem, NewMemory};
pub use persistence::StoreSnapshot;
pub use store::{InMemoryVectorStore, MemoryFilter, SearchHit, VectorStore};
