mod backend;
mod error;
mod wire;

pub use backend::{HttpClientConfig, HttpKlappClient, RemoteClient};
pub use error::ClientError;
