pub mod bar;
pub mod series;

pub use self::bar::{normalize_records, Bar, PriceField, RawBarRecord, RawNumber};
pub use self::series::{IndicatorPoint, IndicatorSeries, IndicatorValue};
