// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Coordination of a relaying session between two peers
//!
//! Each [`ConnectionSession`](common::session::ConnectionSession) pairs this node with one
//! remote peer, and may simultaneously share access (relay the remote's traffic) and get
//! access (relay our traffic through the remote). The session negotiates transport
//! strategies from advertised protocol versions, routes signaling between the remote and
//! the local engines, and reports its state to the owner as [`SessionUpdate`]s.
//!
//! [`SessionUpdate`]: common::session::SessionUpdate

pub mod common;
pub mod util;
