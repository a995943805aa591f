#![deny(missing_docs)]
//! A client for a clustered key-value store that spreads its keyspace over a fixed number of
//! partitions (a.k.a "vbuckets"), each owned by exactly one node of the cluster.
//!
//! This crate provides the [`Client`] itself, as well as a [`vbkv-client`] executable that can
//! be used to issue single operations from the command line.
//!
//! ## Supported Operations
//! The client supports four types of operations (a.k.a "commands"):
//!
//! - `GET` the value of one or more keys
//! - `SET` a key/value pair, with flags, an expiration and an optional cas
//! - `INCR` / `DECR` a counter, creating it with an initial value if it does not exist
//!
//! See the [`Command`] type and [`OperationResult`] for more information on the structure of
//! these operations and their results.
//!
//! ## Routing
//! Every key is hashed with CRC32 and masked with `partitions - 1` to find its partition. The
//! current [`Configuration`] maps that partition to the node owning it, and the request is sent
//! to that node with the partition id written into its header.
//!
//! ## Configuration Feed
//! The cluster publishes its topology as a stream of JSON documents on a long lived HTTP
//! response, see [`ConnectOptions::streaming_url`]. The [`ConfigurationListener`] reads that
//! stream and hands every complete document to the client, which then:
//! - compares the new node list with the old one, position by position, and only reconnects
//! the nodes that changed (or whose connection died)
//! - installs the new partition map
//! - replays operations that were redirected by a node while the cluster was rebalancing
//!
//! If the feed fails, the client re-listens on the admin port of another known node. Only
//! when no node is left to try is the failure handed to the callback registered with
//! [`Client::on_error`]. Closing the client closes the feed connection as well, even while
//! the feed is idle.
//!
//! ## Rebalancing
//! A node that receives a request for a partition it no longer owns answers with a
//! `NotMyVbucket` status. That operation is not reported to the caller. It is parked in a
//! FIFO retry queue and resent, under its original opaque, once the next configuration has
//! been installed. The caller sees exactly one result per operation either way.
//!
//! ## Binary Protocol
//! Requests and responses share a fixed 24 byte header followed by extras, key and value.
//! The [`protocol`] module holds the header layout, the opcodes and an incremental response
//! parser which can be fed arbitrarily sized chunks of a TCP stream.
//!
//! ## Errors
//! Status codes returned by a node are reported per operation, as an [`OperationError`] on
//! the [`OperationResult`]. Failures of the client machinery itself use [`VbkvError`].
//!
//! [`vbkv-client`]: ./vbkv-client.rs

pub use client::Client;
pub use command::{ArithmeticOptions, Command, SetOptions};
pub use configuration::{Configuration, NodeDescriptor, Partition, Route, RoutingError};
pub use error::{ErrorKind, OperationError, Result, VbkvError};
pub use listener::{ConfigurationListener, FeedSource, FeedStream, HttpFeed, JsonStream, ListenerHandle, MAX_DOCUMENT_SIZE};
pub use options::ConnectOptions;
pub use protocol::{Operation, OperationResult};

mod client;
mod command;
mod configuration;
mod coordinator;
mod error;
mod listener;
mod node;
mod options;
pub mod protocol;
