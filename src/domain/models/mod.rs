mod backend;
mod chat;
mod message;
mod query_cache;
mod remote;
mod session;
mod slash_commands;
mod store;
mod timestamp;

pub use backend::*;
pub use chat::*;
pub use message::*;
pub use query_cache::*;
pub use remote::*;
pub use session::*;
pub use slash_commands::*;
pub use store::*;
pub use timestamp::*;
