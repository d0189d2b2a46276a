//! Child process launching and control-endpoint discovery

pub mod handshake;
pub mod supervisor;

pub use handshake::{parse_line, HandshakeParser, HANDSHAKE_PREFIX};
pub use supervisor::{
    serialize_options, ChildProcessInfo, ChildProcessSupervisor, ConsoleLine, ConsoleStream,
    LaunchOptions, ProcessHandle, StopHandler,
};
