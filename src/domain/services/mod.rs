mod chat_bridge;
mod chat_engine;
mod chat_sessions;
mod chat_view;
pub mod observer;
mod session_list;
mod session_sync;
mod titles;

#[cfg(test)]
pub(crate) mod testing;

pub use chat_bridge::*;
pub use chat_engine::*;
pub use chat_sessions::*;
pub use chat_view::*;
pub use session_list::*;
pub use session_sync::*;
pub use titles::*;
