mod http_layers;
pub mod server;
pub mod state;

pub use http_layers::*;
pub use server::{make_app, run_server};
pub use state::{ServerState, ServiceHandle};

#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
}
