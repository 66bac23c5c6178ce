pub mod cache;
pub mod chat;
pub mod llm;
pub mod query;
pub mod refresh;
pub mod tools;
