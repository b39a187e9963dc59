use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::credentials::Token;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamHeaders, StreamKind};

const AUTHORIZATION_HEADER: &str = "Authorization";
const APP_CHECK_HEADER: &str = "X-Firebase-AppCheck";
const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";

/// One open bidirectional stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    /// Next inbound payload. `None` means the peer closed the stream cleanly.
    async fn next(&self) -> Option<FirestoreResult<Vec<u8>>>;

    async fn close(&self) -> FirestoreResult<()>;
}

/// Opens streams to the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(&self, kind: StreamKind, headers: StreamHeaders) -> FirestoreResult<Arc<dyn StreamHandle>>;
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for MultiplexedConnection {
    async fn open_stream(&self, kind: StreamKind, headers: StreamHeaders) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let stream = MultiplexedConnection::open_stream(self, kind, headers).await?;
        Ok(Arc::new(stream) as Arc<dyn StreamHandle>)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamHandle for MultiplexedStream {
    async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        MultiplexedStream::send(self, payload).await
    }

    async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        MultiplexedStream::next(self).await
    }

    async fn close(&self) -> FirestoreResult<()> {
        MultiplexedStream::close(self).await
    }
}

/// Request metadata attached to every stream open.
pub fn stream_headers(database_id: &DatabaseId, auth: Option<&Token>, app_check: Option<&Token>) -> StreamHeaders {
    let mut headers = vec![(RESOURCE_PREFIX_HEADER.to_string(), database_id.database_name())];
    if let Some(token) = auth {
        headers.push((AUTHORIZATION_HEADER.to_string(), format!("Bearer {}", token.value)));
    }
    if let Some(token) = app_check {
        headers.push((APP_CHECK_HEADER.to_string(), token.value.clone()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::credentials::User;
    use crate::firestore::remote::stream::InMemoryTransport;

    #[test]
    fn headers_carry_tokens_and_resource_prefix() {
        let database = DatabaseId::default_for("p");
        let auth = Token::new("secret", User::authenticated("alice"));
        let app_check = Token::new("attest", User::unauthenticated());

        let headers = stream_headers(&database, Some(&auth), Some(&app_check));
        assert_eq!(
            headers,
            vec![
                (RESOURCE_PREFIX_HEADER.to_string(), "projects/p/databases/(default)".to_string()),
                (AUTHORIZATION_HEADER.to_string(), "Bearer secret".to_string()),
                (APP_CHECK_HEADER.to_string(), "attest".to_string()),
            ]
        );
        assert_eq!(stream_headers(&database, None, None).len(), 1);
    }

    #[tokio::test]
    async fn multiplexed_connection_serves_stream_handles() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left: Arc<dyn Connection> = Arc::new(MultiplexedConnection::new(left_transport));
        let right = MultiplexedConnection::new(right_transport);

        let handle = left.open_stream(StreamKind::Write, Vec::new()).await.expect("open");
        let peer = right.accept().await.expect("accept");
        assert_eq!(peer.kind, StreamKind::Write);

        peer.stream.send(b"hello".to_vec()).await.expect("send");
        let payload = handle.next().await.expect("event").expect("payload");
        assert_eq!(payload, b"hello");
        handle.close().await.expect("close");
        assert!(peer.stream.next().await.is_none());
    }
}
