// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tunnels local TCP and UDP traffic to a remote host over a negotiated peer
//! connection, exposed locally as HTTP CONNECT and SOCKS5 proxies.
#![warn(unused_imports)]

pub mod common;
pub mod util;
