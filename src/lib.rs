#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
//! Backpressure-aware queue consumer runtime.
//!
//! `sluice` continuously polls a queue through a broker-agnostic poller
//! seam, pushes messages through a composable processing pipeline
//! (interceptors, your listener, error handling, acknowledgement) and
//! confirms outcomes back to the broker, while an adaptive backpressure
//! stack bounds how many messages are in flight.
//!
//! Consumers are assembled with an explicit builder: register your listener
//! and collaborators as plain values, then hand over the broker adapters.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use sluice::prelude::*;
//!
//! struct MyPoller;
//!
//! #[async_trait]
//! impl MessagePoller for MyPoller {
//!     async fn poll(&self, max_messages: usize) -> Result<Vec<WireMessage>, BoxError> {
//!         // Fetch up to `max_messages` from the broker here.
//!         Ok(Vec::new())
//!     }
//! }
//!
//! struct MyClient;
//!
//! #[async_trait]
//! impl AcknowledgementClient for MyClient {
//!     async fn acknowledge(
//!         &self,
//!         _queue: &QueueIdentity,
//!         _handles: Vec<AckHandle>,
//!     ) -> Result<(), BoxError> {
//!         // Delete the messages on the broker here.
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let consumer = MessageConsumerBuilder::new(QueueIdentity::new(
//!         "orders",
//!         "https://broker.local/orders",
//!     ))
//!     .options(ConsumerOptions::default())
//!     .converter(BytesConverter)
//!     .listener_fn(|message: Message<Bytes>| async move {
//!         println!("processing {}", message.id());
//!         Ok(())
//!     })
//!     .build(MyPoller, MyClient)?;
//!
//!     consumer.start();
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     consumer.stop().await;
//!     Ok(())
//! }
//! ```

mod builder;
mod service;

pub use builder::{MessageConsumer, MessageConsumerBuilder};
pub use service::ServiceListener;

pub use sluice_core::{
    acknowledgement, backpressure, config, error, listener, message, pipeline, sink, source,
};
pub use sluice_core::{BoxError, Error};

/// The commonly used surface in one import.
pub mod prelude {
    pub use crate::builder::{MessageConsumer, MessageConsumerBuilder};
    pub use crate::service::ServiceListener;
    pub use sluice_core::acknowledgement::{
        AcknowledgementClient, AcknowledgementMode, AcknowledgementOrdering,
        AcknowledgementResultCallback,
    };
    pub use sluice_core::config::{BackPressureMode, ConsumerOptions, ListenerMode};
    pub use sluice_core::error::{BoxError, Error};
    pub use sluice_core::listener::{
        batch_listener_fn, listener_fn, ErrorHandler, MessageInterceptor, MessageListener,
    };
    pub use sluice_core::message::{
        AckHandle, BytesConverter, GroupKey, Headers, Message, MessageConverter, MessageId,
        QueueIdentity, WireMessage,
    };
    pub use sluice_core::source::{BackOffPolicy, MessagePoller, SourceState};
}
