// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod transport;
