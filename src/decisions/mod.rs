//! Decision authorities: injection resolution, framework resolution, and the
//! runtime override store they consult.

pub mod framework;
pub mod injection;
pub mod overrides;

pub use framework::{FrameworkDecision, FrameworkDecisionAuthority, FrameworkSource};
pub use injection::{
    DecisionInputs, InjectionDecision, InjectionDecisionService, InjectionType,
};
pub use overrides::{InjectionOverride, OverrideScope, RuntimeOverrides};
