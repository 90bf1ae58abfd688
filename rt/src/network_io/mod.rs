// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// Attach.
pub mod channel;
pub mod length_prefix_protocol;
pub mod msgpack_serde;
pub mod protocol_types;

// Re-export.
pub use channel::*;
pub use length_prefix_protocol::*;
pub use msgpack_serde::*;
pub use protocol_types::*;
