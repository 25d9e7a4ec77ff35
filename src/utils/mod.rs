pub mod clock;
pub mod timing;

pub use self::clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use self::timing::{format_date, measure_sync, measure_time, truncate_string};
