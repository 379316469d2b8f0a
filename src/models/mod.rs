pub mod claims;
pub mod event;
pub mod identity;
pub mod order;
pub mod profile;
