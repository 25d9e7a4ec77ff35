pub mod calculator;
pub mod oscillators;
pub mod overlaps;
pub mod registry;
pub mod spec;
pub mod ta;

// Re-export the calculators and the request types
pub use self::calculator::{IndicatorCalculator, IndicatorKind, IndicatorMethod};
pub use self::oscillators::OscillatorCalculator;
pub use self::overlaps::OverlapCalculator;
pub use self::registry::{IndicatorRegistry, IndicatorTemplate, ValidationResult};
pub use self::spec::{IndicatorCategory, IndicatorSpec, ParamValue};
