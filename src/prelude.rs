//! Convenient re-exports for common bucketline types.
pub use crate::{
    bucket::{BucketKey, BucketTable, RouteGroup, Verb},
    client::{Client, GatewayInfo, Message},
    config::{ClientConfig, DispatcherConfig, SessionConfig},
    dispatcher::{Dispatcher, FrameRequest, Request, Response, SubmitOptions},
    error::{ClientError, DispatchError, ProtocolFault, SessionError, TransportError},
    frame::{Frame, Game, OpCode},
    session::{GatewayEvent, Session, SessionState, SubscriptionId},
    telemetry::{ClientEvent, DispatchEvent, MemorySink, SessionEvent, Telemetry},
    transport::{DuplexLink, DuplexTransport, FrameSink, Inbound, RawResponse, RestRequest, RestTransport},
};
