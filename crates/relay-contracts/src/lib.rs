//! Network-free building blocks for relay: the admission window, the SSE
//! stream decoder, conversation state, the model registry, REPL command
//! parsing and the exchange journal.

pub mod chat;
pub mod conversation;
pub mod events;
pub mod limits;
pub mod models;
pub mod stream;
