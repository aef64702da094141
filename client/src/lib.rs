// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! An asynchronous MQTT 3.1.1 client built on `tokio`.
//!
//! [`Client::connect`] opens a connection in the background and returns a
//! cheaply-cloneable handle immediately; [`Client::subscribe`],
//! [`Client::publish`] and friends may then be called from any thread. The
//! connection itself is driven entirely by a single `tokio` task per
//! [`Client`], so every protocol decision (retransmission, keep-alive,
//! reconnection) happens without additional locking beyond the small,
//! short-lived critical sections documented on each method.
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::time::Duration;
//!
//! use mqtt_client::{Callbacks, Client, ConnectOptions};
//! use mqtt_codec::QoS;
//!
//! # async fn run() -> Result<(), mqtt_client::Error> {
//! let addr: SocketAddr = "127.0.0.1:1883".parse().unwrap();
//! let options = ConnectOptions::builder(addr)
//!     .client_id("demo")
//!     .keep_alive_secs(30)
//!     .build()?;
//!
//! let callbacks = Callbacks::new().on_connection_complete(|accepted, code| {
//!     log::info!("connected: {accepted} ({code:?})");
//! });
//!
//! let client = Client::connect(options, callbacks);
//! client.subscribe(
//!     "demo/#",
//!     QoS::AtLeastOnce,
//!     |topic, payload, _user| log::info!("{topic}: {payload:?}"),
//!     Box::new(()),
//!     |_user| {},
//!     |result| log::info!("subscribe finished: {result:?}"),
//! )?;
//! # let _ = Duration::from_secs(1);
//! # Ok(())
//! # }
//! ```

mod channel;
mod connection;
mod error;
mod options;
mod packet_id;
mod reconnect;
mod request_tracker;
mod state;
mod topic_tree;

pub use connection::{Callbacks, Client};
pub use error::{Error, ErrorKind};
pub use options::{ConnectOptions, ConnectOptionsBuilder, TlsConfig};
pub use reconnect::ReconnectPolicy;
pub use state::{ConnectionState, DisconnectReason};

pub use mqtt_codec::v3::ConnectReturnCode;
pub use mqtt_codec::{PacketId, QoS};
