pub mod codec;
pub mod flow;
pub mod hooks;
pub mod proxy;
pub mod resolver;
pub mod rewrite;
pub mod tls;

mod client;
mod server;
