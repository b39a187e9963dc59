use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value as JsonValue};

use firestore_sync::firestore::error::{resource_exhausted, FirestoreError, FirestoreResult};
use firestore_sync::firestore::model::DatabaseId;
use firestore_sync::firestore::remote::stream::{
    IncomingStream, InMemoryTransport, MultiplexedConnection, PersistentStream, PersistentStreamDelegate,
    PersistentStreamState, StreamContext, StreamKind,
};
use firestore_sync::firestore::remote::EmptyCredentialsProvider;
use firestore_sync::firestore::settings::FirestoreSettings;
use firestore_sync::firestore::util::{AsyncQueue, TimerId};
use firestore_sync::util::backoff::{BackoffSettings, ExponentialBackoff};

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl Events {
    fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }
}

#[async_trait]
impl PersistentStreamDelegate for Events {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.push("open");
        Ok(())
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        self.push(format!("message {message}"));
        Ok(())
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.push(match error {
            Some(error) => format!("close {}", error.code_str()),
            None => "close".to_string(),
        });
        Ok(())
    }
}

struct Fixture {
    queue: AsyncQueue,
    stream: PersistentStream,
    events: Arc<Events>,
    server: MultiplexedConnection,
}

fn fixture() -> Fixture {
    let (client_transport, server_transport) = InMemoryTransport::pair();
    let queue = AsyncQueue::new();
    let context = StreamContext {
        queue: queue.clone(),
        connection: Arc::new(MultiplexedConnection::new(client_transport)),
        database_id: DatabaseId::default_for("p"),
        auth: Arc::new(EmptyCredentialsProvider::new()),
        app_check: Arc::new(EmptyCredentialsProvider::new()),
        settings: FirestoreSettings::default(),
    };
    let events = Arc::new(Events::default());
    let backoff = ExponentialBackoff::with_rng(BackoffSettings::default(), StdRng::seed_from_u64(3));
    let stream = PersistentStream::with_backoff(
        StreamKind::Listen,
        backoff,
        context,
        Arc::clone(&events) as Arc<dyn PersistentStreamDelegate>,
    );
    Fixture {
        queue,
        stream,
        events,
        server: MultiplexedConnection::new(server_transport),
    }
}

impl Fixture {
    async fn on_queue(&self, f: impl FnOnce(PersistentStream) -> BoxFuture<'static, ()> + Send + 'static) {
        let stream = self.stream.clone();
        self.queue
            .enqueue(move || async move {
                f(stream).await;
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn accept(&self) -> IncomingStream {
        let incoming = tokio::time::timeout(Duration::from_secs(2), self.server.accept())
            .await
            .expect("stream opened")
            .unwrap();
        self.settle().await;
        incoming
    }

    async fn settle(&self) {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.queue.drain().await.unwrap();
        }
    }
}

#[tokio::test]
async fn stream_walks_through_open_healthy_and_stopped() {
    let f = fixture();
    f.on_queue(|stream| Box::pin(async move { stream.start() })).await;
    let incoming = f.accept().await;
    assert_eq!(f.stream.state(), PersistentStreamState::Open);

    incoming
        .stream
        .send(serde_json::to_vec(&json!({"hello": true})).unwrap())
        .await
        .unwrap();
    f.settle().await;
    assert_eq!(f.stream.state(), PersistentStreamState::Healthy);
    assert!(!f.queue.contains_delayed_operation(TimerId::HealthCheckTimeout));

    f.on_queue(|stream| Box::pin(async move { stream.stop().await })).await;
    assert_eq!(f.stream.state(), PersistentStreamState::Stopped);
    assert_eq!(
        f.events.all(),
        vec!["open".to_string(), "message {\"hello\":true}".to_string(), "close".to_string()]
    );
}

#[tokio::test]
async fn resource_exhaustion_pins_reconnects_to_the_maximum_delay() {
    let f = fixture();
    f.on_queue(|stream| Box::pin(async move { stream.start() })).await;
    let mut incoming = f.accept().await;

    for attempt in 0..10 {
        incoming.stream.fail(resource_exhausted("quota")).await.unwrap();
        f.settle().await;
        assert_eq!(f.stream.state(), PersistentStreamState::Error, "attempt {attempt}");
        assert_eq!(f.stream.backoff_base(), Duration::from_secs(60), "attempt {attempt}");

        f.on_queue(|stream| Box::pin(async move { stream.start() })).await;
        assert_eq!(f.stream.state(), PersistentStreamState::Backoff);
        assert!(f.queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
        f.queue
            .run_all_delayed_operations_until(TimerId::ListenStreamConnectionBackoff)
            .await
            .unwrap();
        incoming = f.accept().await;
    }

    assert!(f.stream.is_open());
    assert_eq!(
        f.events.all().iter().filter(|event| *event == "close firestore/resource-exhausted").count(),
        10
    );

    // A clean close forgets the penalty.
    f.on_queue(|stream| Box::pin(async move { stream.stop().await })).await;
    assert_eq!(f.stream.backoff_base(), Duration::ZERO);
}
