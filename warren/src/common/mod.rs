// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::time::Duration;

pub mod certgen;
pub mod cidr;
pub mod config;
pub mod flow;
pub mod tls;
pub mod version;
pub mod wire;

/// Reads on any byte stream give up after this long and are treated as EOF.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Cadence of the background sweeps that reap idle flows and routes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Fire-and-forget keepalive cadence on every peer stream.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for the proxy's dial to an intercepted flow's original target.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the server router waits for room on a peer's outbound queue
/// before erroring the route.
pub const ROUTER_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-read chunk size on local and target sockets.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Depth of the bounded outbound queue feeding each stream's writer task.
pub const OUTBOUND_QUEUE_DEPTH: usize = 100;
