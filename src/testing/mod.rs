//! Testing infrastructure
//!
//! Mock exchange connector and a local WebSocket server used by the unit
//! and integration tests.

pub mod mock_exchange;
pub mod ws_server;

pub use mock_exchange::{MockConnection, MockExchange, MockReply, RecordedCall};
pub use ws_server::LocalStreamServer;
