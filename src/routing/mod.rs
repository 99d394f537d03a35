pub mod path;
pub mod registry;

pub use path::{forwarded_path, split_proxy_path, target_url, PROXY_PREFIX};
pub use registry::{RouteRegistry, ServiceRoute};
