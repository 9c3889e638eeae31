//! SOS alert agent.
//!
//! Polls a remote telemetry channel for an emergency trigger and, on each
//! active episode, fans out a capped set of text alerts plus one delayed
//! voice call to an ordered list of contacts.
//!
//! - [`poller`]: periodic fetch loop, cycles never overlap
//! - [`engine`]: single owner of the episode state
//! - [`state_machine`]: edge detection and alert budget
//! - [`dispatcher`]: text fan-out and the delayed voice call
//! - [`channels`]: outbound text/voice transports
//! - [`feed`]: telemetry records and the channel feed client

pub mod channels;
pub mod config;
pub mod contacts;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod feed;
pub mod location;
pub mod messages;
pub mod poller;
pub mod state_machine;
