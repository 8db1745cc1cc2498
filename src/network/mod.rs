//! Client-facing side: records, dispatch and the TCP transport.

pub mod gateway;
pub mod messages;
pub mod server;
pub mod session;

pub use gateway::Gateway;
pub use messages::{Request, Response};
pub use server::GatewayServer;
pub use session::{ClientSession, SessionManager};
