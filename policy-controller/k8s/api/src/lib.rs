#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod policy;

pub use k8s_gateway_api as gateway;
pub use k8s_openapi::{
    api::{self, core::v1::Service},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams},
    Client, Error, Resource, ResourceExt,
};
