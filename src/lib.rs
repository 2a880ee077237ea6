//! Notifier - reliable event delivery over AMQP
//!
//! Publishes notification events to a topic exchange with publisher
//! confirms, buffers them while the broker is unreachable, and consumes
//! them through bounded, failure-isolated handlers.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod handlers;
pub mod producer;
pub mod utils;
