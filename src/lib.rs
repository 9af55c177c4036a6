// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Control library for the Grid+ V2 six-channel serial fan controller.
//!
//! - [`serial`]: exclusive access to the serial link
//! - [`grid`]: wire protocol and device operations
//! - [`curve`]: fan curves and voltage quantization
//! - [`sensors`]: temperature sources and aggregation
//! - [`polling`]: background telemetry and automatic control loop
//! - [`dispatcher`]: foreground fan commands
//! - [`controller`]: session orchestration
//! - [`config`] and [`protocol`]: daemon configuration and client protocol

pub mod config;
pub mod controller;
pub mod curve;
pub mod dispatcher;
pub mod error;
pub mod grid;
pub mod polling;
pub mod protocol;
pub mod sensors;
pub mod serial;
