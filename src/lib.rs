pub mod ber;
pub mod config;
pub mod conn;
pub mod directory;
pub mod handler;
pub mod proto;
pub mod requests;
pub mod server;
pub mod tls;
pub mod writer;

pub use config::Config;
pub use conn::{Connection, EngineError};
pub use directory::InMemoryDirectory;
pub use handler::{BindOutcome, LdapOperations, OpError, SearchChannel, SessionInfo};
pub use proto::{LdapResult, ResultCode, SearchEntry};
pub use server::LdapServer;
pub use writer::MessageWriter;
