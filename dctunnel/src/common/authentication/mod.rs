// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Authorization of stream open requests arriving at the host
mod traits;
pub use traits::*;

mod no_op_authentication;
pub use no_op_authentication::NoOpAuthenticator;

mod token_authentication;
pub use token_authentication::ExactTokenAuthenticator;
