//! Generated protobuf/tonic bindings for `proto/controller.proto`.
//!
//! `build.rs` compiles the schema at build time with `tonic-build`; this
//! module just brings the generated `controller.v1` package into scope
//! under a short name so the rest of the crate can write `pb::App` instead
//! of the full generated path.

#![allow(clippy::all)]

tonic::include_proto!("controller.v1");
