//! AMQP protocol transport.
//!
//! This module contains the transport implementation for AMQP-based
//! brokers. Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)

mod lapin;

pub use lapin::create_transport as create_lapin_transport;
