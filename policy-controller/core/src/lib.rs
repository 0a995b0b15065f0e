#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod ancestor;
pub mod condition;
mod conflict;
mod engine;
mod register;
mod reporter;

pub use self::{
    ancestor::{AncestorKey, AncestorRef, ControllerName, InvalidControllerName},
    condition::{
        Condition, ConditionSet, ConditionStatus, ConditionsExceeded, EvictionPolicy,
        InvalidCondition, MAX_CONDITIONS_PER_ANCESTOR,
    },
    conflict::{
        Attachment, Candidate, ConflictResolver, PolicyId, PolicyTarget, Resolution, TargetLookup,
    },
    engine::{PolicyEngine, Unimplementable},
    register::{Applied, CapacityExceeded, RegisterError, Slot, StatusRegister, MAX_ANCESTORS},
    reporter::{AncestorReporter, Report},
};

pub const DEFAULT_CONTROLLER_NAME: &str = "networking.gke.io/gateway";
