pub mod body;
pub mod handlers;
pub mod middleware;
