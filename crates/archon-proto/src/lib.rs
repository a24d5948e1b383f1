//! Generated tonic/prost bindings for the `ArchonControl` RPC surface, plus
//! `convert` for translating between these wire types and the domain types
//! in `archon-core` and `archon-exposure`.
#![allow(missing_docs)]

pub mod convert;

pub mod archon {
    tonic::include_proto!("archon");
}

pub use archon::*;
