// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Client sessions: admission rules and the request state machine.

pub mod args;
pub mod engine;
pub mod policy;
pub mod registry;

pub use args::SessionArgs;
pub use engine::{Info, Session};
pub use policy::{resolve, Denied, Grant, Policy};
pub use registry::{Registration, Registry};
