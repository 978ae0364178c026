//! End-to-end runtime tests against in-memory broker fakes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sluice_core::acknowledgement::{
    handler_for, AcknowledgementMode, BatchingAcknowledgementProcessor,
    ClientAcknowledgementExecutor, ImmediateAcknowledgementProcessor,
};
use sluice_core::backpressure::standard_handler;
use sluice_core::config::{BackPressureMode, ConsumerOptions};
use sluice_core::error::{BoxError, ConversionError};
use sluice_core::listener::listener_fn;
use sluice_core::message::{BytesConverter, Message, MessageConverter, QueueIdentity, WireMessage};
use sluice_core::pipeline::{MessageProcessingPipeline, PipelineConfiguration};
use sluice_core::sink::FanOutMessageSink;
use sluice_core::source::{PollingMessageSource, SourceState};

mod common;

use common::{wait_until, wire_batch, RecordingClient, TestPoller};

fn queue() -> QueueIdentity {
    QueueIdentity::new("orders", "https://broker.local/orders")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sluice_core=debug")
        .try_init();
}

struct Harness {
    source: PollingMessageSource<Bytes>,
    processed: Arc<AtomicUsize>,
    client: RecordingClient,
}

fn build_consumer(
    poller: Arc<TestPoller>,
    options: ConsumerOptions,
    listener_outcome: fn() -> Result<(), BoxError>,
) -> Harness {
    let client = RecordingClient::default();
    let executor = Arc::new(ClientAcknowledgementExecutor::new(client.clone(), queue()));
    let processor = Arc::new(
        BatchingAcknowledgementProcessor::new(executor, queue(), &options, None).unwrap(),
    );

    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    let configuration = PipelineConfiguration::builder()
        .listener(Arc::new(listener_fn(move |_message: Message<Bytes>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                listener_outcome()
            }
        })))
        .acknowledgement_handler(handler_for(options.acknowledgement_mode))
        .build()
        .unwrap();
    let pipeline = Arc::new(MessageProcessingPipeline::from_configuration(configuration));

    let source = PollingMessageSource::builder(queue())
        .poller(poller)
        .converter(Arc::new(BytesConverter))
        .sink(Arc::new(FanOutMessageSink::new(pipeline)))
        .back_pressure(standard_handler(&options))
        .acknowledgement_processor(processor)
        .shutdown_timeout(options.listener_shutdown_timeout)
        .acknowledgement_shutdown_timeout(options.acknowledgement_shutdown_timeout)
        .build()
        .unwrap();

    Harness {
        source,
        processed,
        client,
    }
}

#[tokio::test]
async fn processes_and_acknowledges_a_full_batch() {
    init_tracing();
    let poller = TestPoller::new(vec![wire_batch(10)], 10);
    let options = ConsumerOptions {
        back_pressure_mode: BackPressureMode::AlwaysPollMax,
        acknowledgement_threshold: 10,
        acknowledgement_interval: Duration::from_millis(50),
        max_delay_between_polls: Duration::from_millis(100),
        ..ConsumerOptions::default()
    };
    let harness = build_consumer(poller.clone(), options, || Ok(()));

    harness.source.start();
    assert!(
        wait_until(Duration::from_secs(5), || harness.client.acknowledged() == 10).await,
        "all 10 messages should be acknowledged"
    );
    assert_eq!(harness.processed.load(Ordering::SeqCst), 10);

    // Permits were fully released: every poll, including the ones after the
    // batch, requested the full batch again.
    assert!(
        wait_until(Duration::from_secs(2), || poller.requests().len() >= 2).await,
        "the source should keep polling"
    );
    assert!(poller.requests().iter().all(|&requested| requested == 10));

    harness.source.stop().await;
    assert_eq!(harness.source.state(), SourceState::Stopped);
}

#[tokio::test]
async fn failed_messages_are_not_acknowledged_on_success_mode() {
    let poller = TestPoller::new(vec![wire_batch(4)], 10);
    let options = ConsumerOptions {
        acknowledgement_threshold: 2,
        acknowledgement_interval: Duration::from_millis(30),
        ..ConsumerOptions::default()
    };
    let harness = build_consumer(poller, options, || Err::<(), BoxError>("boom".into()));

    harness.source.start();
    assert!(
        wait_until(Duration::from_secs(5), || {
            harness.processed.load(Ordering::SeqCst) == 4
        })
        .await
    );
    // Give the acknowledgement path time to (wrongly) fire.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.client.acknowledged(), 0);

    harness.source.stop().await;
}

#[tokio::test]
async fn always_mode_acknowledges_failed_messages() {
    let poller = TestPoller::new(vec![wire_batch(4)], 10);
    let options = ConsumerOptions {
        acknowledgement_mode: AcknowledgementMode::Always,
        acknowledgement_threshold: 4,
        acknowledgement_interval: Duration::from_millis(30),
        ..ConsumerOptions::default()
    };
    let harness = build_consumer(poller, options, || Err::<(), BoxError>("boom".into()));

    harness.source.start();
    assert!(
        wait_until(Duration::from_secs(5), || harness.client.acknowledged() == 4).await,
        "failed messages should still be acknowledged in always mode"
    );
    // Exactly one acknowledgement per message.
    let total: usize = harness.client.calls().iter().map(Vec::len).sum();
    assert_eq!(total, 4);

    harness.source.stop().await;
}

#[tokio::test]
async fn conversion_failures_do_not_fail_the_batch() {
    let poller = TestPoller::new(vec![wire_batch(5)], 10);
    let options = ConsumerOptions {
        acknowledgement_threshold: 4,
        acknowledgement_interval: Duration::from_millis(30),
        ..ConsumerOptions::default()
    };

    let client = RecordingClient::default();
    let executor = Arc::new(ClientAcknowledgementExecutor::new(client.clone(), queue()));
    let processor = Arc::new(
        ImmediateAcknowledgementProcessor::new(executor, queue(), &options, None),
    );
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    let configuration = PipelineConfiguration::builder()
        .listener(Arc::new(listener_fn(move |_message: Message<Bytes>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })))
        .build()
        .unwrap();
    let pipeline = Arc::new(MessageProcessingPipeline::from_configuration(configuration));

    // "m-2" is poisoned: its conversion fails, the other four flow through.
    let converter = |wire: WireMessage| -> Result<Message<Bytes>, ConversionError> {
        if wire.message_id == "m-2" {
            return Err(ConversionError::new(wire.message_id, "malformed payload"));
        }
        BytesConverter.convert(wire)
    };

    let source = PollingMessageSource::builder(queue())
        .poller(poller)
        .converter(Arc::new(converter))
        .sink(Arc::new(FanOutMessageSink::new(pipeline)))
        .back_pressure(standard_handler(&options))
        .acknowledgement_processor(processor)
        .build()
        .unwrap();

    source.start();
    assert!(
        wait_until(Duration::from_secs(5), || client.acknowledged() == 4).await,
        "the four convertible messages should be processed and acknowledged"
    );
    assert_eq!(processed.load(Ordering::SeqCst), 4);

    source.stop().await;
    assert_eq!(source.state(), SourceState::Stopped);
}

#[tokio::test]
async fn typed_payloads_flow_through_a_custom_converter() {
    #[derive(Debug, Clone, PartialEq, serde::Deserialize)]
    struct Order {
        id: u64,
    }

    let batches = vec![vec![
        WireMessage::new("m-0", r#"{"id":7}"#, "r-0"),
        WireMessage::new("m-1", r#"{"id":8}"#, "r-1"),
    ]];
    let poller = TestPoller::new(batches, 10);
    let options = ConsumerOptions {
        acknowledgement_threshold: 2,
        acknowledgement_interval: Duration::from_millis(30),
        ..ConsumerOptions::default()
    };

    let client = RecordingClient::default();
    let executor = Arc::new(ClientAcknowledgementExecutor::new(client.clone(), queue()));
    let processor = Arc::new(
        BatchingAcknowledgementProcessor::new(executor, queue(), &options, None).unwrap(),
    );
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let listener_seen = seen.clone();
    let configuration = PipelineConfiguration::builder()
        .listener(Arc::new(listener_fn(move |message: Message<Order>| {
            let seen = listener_seen.clone();
            async move {
                seen.lock().unwrap().push(message.payload().id);
                Ok(())
            }
        })))
        .build()
        .unwrap();
    let pipeline = Arc::new(MessageProcessingPipeline::from_configuration(configuration));

    let converter = |wire: WireMessage| -> Result<Message<Order>, ConversionError> {
        let order: Order = serde_json::from_slice(&wire.payload)
            .map_err(|e| ConversionError::new(wire.message_id.clone(), e))?;
        Ok(Message::new(order, wire.receipt))
    };

    let source = PollingMessageSource::builder(queue())
        .poller(poller)
        .converter(Arc::new(converter))
        .sink(Arc::new(FanOutMessageSink::new(pipeline)))
        .back_pressure(standard_handler(&options))
        .acknowledgement_processor(processor)
        .build()
        .unwrap();

    source.start();
    assert!(wait_until(Duration::from_secs(5), || client.acknowledged() == 2).await);
    let mut ids = seen.lock().unwrap().clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![7, 8]);

    source.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_reaches_stopped() {
    let poller = TestPoller::new(Vec::new(), 10);
    let options = ConsumerOptions {
        listener_shutdown_timeout: Duration::from_millis(200),
        max_delay_between_polls: Duration::from_millis(50),
        ..ConsumerOptions::default()
    };
    let harness = build_consumer(poller, options, || Ok(()));

    harness.source.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.source.is_running());

    harness.source.stop().await;
    assert_eq!(harness.source.state(), SourceState::Stopped);

    // A second stop is a no-op.
    harness.source.stop().await;
    assert_eq!(harness.source.state(), SourceState::Stopped);
}
