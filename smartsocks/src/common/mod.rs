// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod routing;
pub mod socks5;
pub mod transport;
