//! Archive staging cart service.
//!
//! Clients ask for a set of archive files under a cart uid, poll the cart's
//! status while the files are pulled onto a local staging volume, download
//! the result as one streamed tar, and delete it when done. Disk space is
//! reclaimed by evicting the least recently used carts.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
