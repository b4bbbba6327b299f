// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod authentication;
pub mod daemon;
pub mod dispatcher;
pub mod frontend;
pub mod mux;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;
