pub mod job;
pub mod session;
pub mod source;
pub mod worker;

pub use self::job::{DateRange, QueryRequest, QueryResult};
pub use self::session::QuerySession;
pub use self::source::{BarQuery, BarSource, JsonFileBarSource};
pub use self::worker::{build_result, merge_delta, LiveSubscription, QueryService, UpdateCallback};
