//! Gate enforcement: accumulation from labeled sources, verdict
//! classification, outcome rules, and shell verification.

pub mod accumulator;
pub mod enforcement;
pub mod verification;

pub use accumulator::{AccumulatedGate, DisplacedGate, GateAccumulator, GateSource};
pub use enforcement::{
    apply_verdict, build_plan, parse_verdict, EnforcementPlan, ParsedVerdict, VerdictClass,
    VerdictOutcome, VerdictSource,
};
pub use verification::{
    preset_defaults, run as run_verification, VerificationOutcome, VerificationRequest,
};
