#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
//! Core engine for sluice: a backpressure-aware queue consumer runtime.
//!
//! The engine continuously polls a queue through the [`source::MessagePoller`]
//! seam, converts wire messages into typed [`message::Message`]s, runs them
//! through a composable [`pipeline`] (interceptors, listener, error handling,
//! acknowledgement) and confirms outcomes back to the broker through the
//! [`acknowledgement`] subsystem, while the [`backpressure`] stack bounds how
//! many messages are in flight.
//!
//! Basic usage
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use sluice_core::acknowledgement::{
//!     AcknowledgementClient, ClientAcknowledgementExecutor, ImmediateAcknowledgementProcessor,
//! };
//! use sluice_core::backpressure;
//! use sluice_core::config::ConsumerOptions;
//! use sluice_core::error::BoxError;
//! use sluice_core::listener::listener_fn;
//! use sluice_core::message::{AckHandle, BytesConverter, Message, QueueIdentity, WireMessage};
//! use sluice_core::pipeline::{MessageProcessingPipeline, PipelineConfiguration};
//! use sluice_core::sink::FanOutMessageSink;
//! use sluice_core::source::{MessagePoller, PollingMessageSource};
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
//!     let queue = QueueIdentity::new("orders", "https://broker.local/orders");
//!     let options = ConsumerOptions::default();
//!
//!     let executor = Arc::new(ClientAcknowledgementExecutor::new(MyClient, queue.clone()));
//!     let processor = Arc::new(ImmediateAcknowledgementProcessor::new(
//!         executor,
//!         queue.clone(),
//!         &options,
//!         None,
//!     ));
//!
//!     let configuration = PipelineConfiguration::builder()
//!         .listener(Arc::new(listener_fn(|message: Message<Bytes>| async move {
//!             println!("processing {}", message.id());
//!             Ok(())
//!         })))
//!         .build()?;
//!     let pipeline = Arc::new(MessageProcessingPipeline::from_configuration(configuration));
//!
//!     let source = PollingMessageSource::builder(queue)
//!         .poller(Arc::new(MyPoller))
//!         .converter(Arc::new(BytesConverter))
//!         .sink(Arc::new(FanOutMessageSink::new(pipeline)))
//!         .back_pressure(backpressure::standard_handler(&options))
//!         .acknowledgement_processor(processor)
//!         .build()?;
//!
//!     source.start();
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     source.stop().await;
//!     Ok(())
//! }
//! ```

pub mod acknowledgement;
pub mod backpressure;
pub mod config;
pub mod error;
pub mod listener;
pub mod message;
pub mod pipeline;
pub mod sink;
pub mod source;

pub use error::{BoxError, Error};
pub use message::{Message, QueueIdentity, WireMessage};
