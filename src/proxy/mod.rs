pub mod context;
pub mod dispatcher;
mod handler;

pub use context::BoxBody;
pub use dispatcher::{InboundRequest, ProxyDispatcher, ProxyResult};
pub use handler::handle_request;
