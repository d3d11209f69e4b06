pub mod chat;
pub mod events;
pub mod insight;
pub mod plot;
pub mod types;
