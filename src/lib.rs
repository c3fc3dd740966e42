//! trap-relay library
//!
//! Receives SNMP traps over UDP, turns each one into a structured JSON record
//! and relays it to Redis pub/sub and/or an external script.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod logging;
pub mod publishers;
pub mod snmp_listener;
pub mod trap;

pub use codec::{decode_packet, DecodeError, SnmpValue, SnmpVersion, TrapPacket, VarBind};
pub use config::Config;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use publishers::{ChannelPublisher, Publisher, RedisSink, RetryPolicy, ScriptPublisher};
pub use snmp_listener::SnmpListener;
pub use trap::{assemble_trap, decode_variable, Field, FieldType, FieldValue, TrapRecord};
