//! Control core of a voice-assistant device: the state machine, the audio
//! pipeline around it, and the transports that carry a conversation.

pub mod assets;
pub mod audio;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod control_server;
pub mod error;
pub mod orchestrator;
pub mod ota;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod tasks;
pub mod transport;
pub mod work_queue;

#[cfg(test)]
pub(crate) mod testing;
