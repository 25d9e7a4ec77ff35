pub mod client;
pub mod hub;
pub mod machine;
pub mod message;
pub mod transport;

pub use self::client::{StreamCallback, StreamClient, StreamEvent, StreamSettings, Subscription};
pub use self::hub::StreamHub;
pub use self::machine::{BackoffPolicy, ConnectionAction, ConnectionEvent, ConnectionMachine, ConnectionState};
pub use self::message::FeedMessage;
pub use self::transport::{FeedConnection, FeedTransport, WsTransport};
