// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire-level pieces shared by both peers of a session
//!
//! Envelopes travel over the signaling channel; protocol versions are advertised out of
//! band and determine which transport strategy the engines are built with.

pub mod router;
pub mod session_id;
pub mod signal;
pub mod version;

pub use router::{Route, SignalRouter};
pub use session_id::{RandomLowercaseGenerator, SessionIdGenerator};
pub use signal::{PeerRole, SignalEnvelope, SignalError, TransportSignal};
pub use version::{
  Obfuscation, ProtocolVersion, StreamCipherKey, TransportStrategy, VersionNegotiator,
};
