mod connection;
mod message;
mod process;

pub use connection::{parse_params, Connection, ConnectionOptions, MessageHandler, WireError};
pub use message::{id_key, validate_envelope, Message};
pub use process::{spawn_connection, LaunchSpec};
