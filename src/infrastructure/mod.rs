pub mod backends;
pub mod cache;
pub mod remote;
pub mod stores;
