#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod index;
mod metrics;
mod policy;
mod resource_id;
mod routes;


pub use self::{
    controller::Controller,
    index::{Index, SharedIndex, Update},
    metrics::{ControllerMetrics, IndexMetrics},
    policy::PolicyKind,
    resource_id::{GroupKindName, NamespaceGroupKindName},
};
