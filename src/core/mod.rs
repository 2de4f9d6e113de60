pub mod clock;
pub mod errors;

pub use clock::{parse_rfc3339_ms, rfc3339_ms, system_clock, Clock, ManualClock, QuantaClock, SystemClock};
pub use errors::{
    EngineError, EngineResult, ErrorCategory, ErrorContext, ErrorHandler, ErrorManager,
    ErrorSeverity, ErrorStats,
};
