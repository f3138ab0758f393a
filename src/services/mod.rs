pub mod archive;
pub mod bundler;
pub mod cart_service;
pub mod cart_store;
pub mod delivery;
pub mod eviction;
pub mod layout;
pub mod queue;
pub mod space;
pub mod staging;
