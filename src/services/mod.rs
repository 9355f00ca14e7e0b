pub mod cache;
pub mod catalog;
pub mod events;
pub mod features;
pub mod feedback;
pub mod kafka;
pub mod recommendation;
pub mod store;
