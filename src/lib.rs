// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod completion;
mod otel;

#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod lapin_transport;
pub mod message;
pub mod queue;
pub mod retry;
pub mod transport;
