//! Order execution: the result FSM, the venue boundary, a deterministic
//! paper venue, and the executor that drives intents through their lifecycle
//! with idempotent retries.

mod executor;
mod fsm;
mod http;
mod paper;
mod venue;

pub use executor::{
    Clock, ExecutionReport, Executor, HealthSnapshot, RetryBudget, SafetyTrigger, SystemClock,
};
pub use fsm::{validate_transition, TransitionError};
pub use http::RestVenue;
pub use paper::PaperVenue;
pub use venue::{
    CancelOutcome, PositionsSnapshot, SubmitOutcome, SubmitRequest, VenueAdapter, VenueError,
    VenueOrder,
};
