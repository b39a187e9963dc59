pub mod bloom_filter;
pub mod connection;
pub mod credentials;
pub mod datastore;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use connection::{stream_headers, Connection, StreamHandle};
pub use credentials::{
    CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider, Token, User,
    UserChangeListener,
};
pub use datastore::{Datastore, InMemoryDatastore};
pub use online_state_tracker::{OnlineState, OnlineStateTracker, MAX_WATCH_STREAM_FAILURES};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use rpc_error::decode_rpc_error;
pub use serializer::{JsonProtoSerializer, WriteResponse};
pub use stream::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, PersistentStreamState, StreamContext,
    StreamKind, StreamTransport,
};
pub use streams::{ListenStream, ListenStreamDelegate, WriteStream, WriteStreamDelegate};
pub use watch_change::{
    DocumentWatchChange, ExistenceFilter, ExistenceFilterChange, TargetChangeState, WatchChange,
    WatchTargetChange,
};
pub use watch_change_aggregator::{
    BloomFilterApplicationStatus, ExistenceFilterMismatchInfo, TargetMetadataProvider,
    WatchChangeAggregator,
};
