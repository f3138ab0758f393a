pub mod cart_handlers;
pub mod health_handlers;
