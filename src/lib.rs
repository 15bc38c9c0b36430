//! Air-conditioning control over MQTT
//!
//! [`mqtt::BrokerClient`] owns the process-wide broker connection and
//! [`bridge::StatusBridge`] turns its events into per-device status records.
//! [`command::DeviceCommand`] describes what can be sent to a unit.

pub mod bridge;
pub mod command;
pub mod config;
pub mod mqtt;

#[cfg(test)]
pub(crate) mod test_utils;
