//! Typed facade over the dispatcher and the gateway session.
//!
//! Each call validates its arguments, classifies its route into a bucket, and submits the
//! request through the shared [`Dispatcher`]. Responses are decoded with `serde_json`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::bucket::{BucketKey, BucketTable, Verb};
use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, Request, Response};
use crate::error::{ClientError, DispatchError};
use crate::session::Session;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::Telemetry;
use crate::transport::{DuplexTransport, RestRequest, RestTransport};

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_BULK_DELETE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    rest: Arc<dyn RestTransport>,
    duplex: Arc<dyn DuplexTransport>,
    table: BucketTable,
    telemetry: Telemetry,
    sleeper: Arc<dyn Sleeper>,
}

impl ClientBuilder {
    /// Route table used to classify requests.
    pub fn table(mut self, table: BucketTable) -> Self {
        self.table = table;
        self
    }

    /// Telemetry shared by the dispatcher and the session.
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Client {
        let dispatcher = Dispatcher::builder(self.rest)
            .config(self.config.dispatcher)
            .telemetry(self.telemetry.clone())
            .build();
        let session = Session::builder(self.config.session, dispatcher.clone(), self.duplex)
            .telemetry(self.telemetry)
            .sleeper(self.sleeper)
            .build();
        Client { dispatcher, session, table: self.table }
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    dispatcher: Dispatcher,
    session: Session,
    table: BucketTable,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        rest: Arc<dyn RestTransport>,
        duplex: Arc<dyn DuplexTransport>,
    ) -> Self {
        Self::builder(config, rest, duplex).build()
    }

    pub fn builder(
        config: ClientConfig,
        rest: Arc<dyn RestTransport>,
        duplex: Arc<dyn DuplexTransport>,
    ) -> ClientBuilder {
        ClientBuilder {
            config,
            rest,
            duplex,
            table: BucketTable::standard(),
            telemetry: Telemetry::null(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn table(&self) -> &BucketTable {
        &self.table
    }

    async fn call(
        &self,
        verb: Verb,
        route: &str,
        key: BucketKey,
        body: Option<Value>,
    ) -> Result<Response, ClientError> {
        let mut request = RestRequest::new(verb, route);
        if let Some(body) = body {
            let bytes = serde_json::to_vec(&body).map_err(|e| DispatchError::Decode(e.to_string()))?;
            request = request.with_body(bytes);
        }
        debug!(verb = %verb, route, bucket = %key, "submitting request");
        Ok(self.dispatcher.submit(key, Request::Rest(request)).await?)
    }

    /// Send `body` to `route` on bucket `key` and decode the response as `T`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        verb: Verb,
        route: &str,
        key: BucketKey,
        body: Option<Value>,
    ) -> Result<T, ClientError> {
        let body = self.call(verb, route, key, body).await?.into_body();
        serde_json::from_slice(&body).map_err(|e| DispatchError::Decode(e.to_string()).into())
    }

    async fn send_empty(
        &self,
        verb: Verb,
        route: &str,
        owner: Option<u64>,
        body: Option<Value>,
    ) -> Result<(), ClientError> {
        let key = self.table.classify(verb, route, owner);
        self.call(verb, route, key, body).await.map(drop)
    }

    pub async fn get_gateway(&self) -> Result<GatewayInfo, ClientError> {
        let key = self.table.classify(Verb::Get, "gateway", None);
        self.send_json(Verb::Get, "gateway", key, None).await
    }

    /// Post `content` to `channel`. `owner` is the guild the channel belongs to, or `None`
    /// for a direct-message channel.
    pub async fn send_message(
        &self,
        channel: u64,
        owner: Option<u64>,
        content: &str,
    ) -> Result<Message, ClientError> {
        validate_content(content)?;
        let route = format!("channels/{}/messages", channel);
        let key = self.table.classify(Verb::Post, &route, owner);
        self.send_json(Verb::Post, &route, key, Some(json!({ "content": content }))).await
    }

    pub async fn edit_message(
        &self,
        channel: u64,
        owner: Option<u64>,
        message: u64,
        content: &str,
    ) -> Result<Message, ClientError> {
        validate_content(content)?;
        let route = format!("channels/{}/messages/{}", channel, message);
        let key = self.table.classify(Verb::Patch, &route, owner);
        self.send_json(Verb::Patch, &route, key, Some(json!({ "content": content }))).await
    }

    pub async fn delete_message(
        &self,
        channel: u64,
        owner: Option<u64>,
        message: u64,
    ) -> Result<(), ClientError> {
        let route = format!("channels/{}/messages/{}", channel, message);
        self.send_empty(Verb::Delete, &route, owner, None).await
    }

    /// Delete up to 100 messages at once. A single id is deleted on its own.
    pub async fn delete_messages(
        &self,
        channel: u64,
        owner: Option<u64>,
        messages: &[u64],
    ) -> Result<(), ClientError> {
        match messages.len() {
            0 => Err(ClientError::Validation("no messages to delete".into())),
            1 => self.delete_message(channel, owner, messages[0]).await,
            n if n > MAX_BULK_DELETE => Err(ClientError::Validation(format!(
                "cannot delete more than {} messages at once, got {}",
                MAX_BULK_DELETE, n
            ))),
            _ => {
                let route = format!("channels/{}/messages/bulk-delete", channel);
                let ids: Vec<String> = messages.iter().map(u64::to_string).collect();
                self.send_empty(Verb::Post, &route, owner, Some(json!({ "messages": ids }))).await
            }
        }
    }

    /// Change a nickname in `guild`: the current user's when `user` is `None`.
    pub async fn modify_nickname(
        &self,
        guild: u64,
        user: Option<u64>,
        nick: &str,
    ) -> Result<(), ClientError> {
        let route = match user {
            Some(user) => format!("guilds/{}/members/{}", guild, user),
            None => format!("guilds/{}/members/@me/nick", guild),
        };
        self.send_empty(Verb::Patch, &route, Some(guild), Some(json!({ "nick": nick }))).await
    }

    /// Look up the gateway url and start the session.
    pub async fn start(&self) -> Result<(), ClientError> {
        let gateway = self.get_gateway().await?;
        info!(url = %gateway.url, "gateway located");
        self.session.set_gateway_url(gateway.url);
        self.session.connect()?;
        Ok(())
    }

    /// Stop the session, then cancel everything still queued or in flight.
    pub async fn logout(&self) {
        self.session.disconnect().await;
        self.dispatcher.drain_and_cancel();
        info!("logged out");
    }
}

fn validate_content(content: &str) -> Result<(), ClientError> {
    let chars = content.chars().count();
    if chars == 0 {
        return Err(ClientError::Validation("message content is empty".into()));
    }
    if chars > MAX_MESSAGE_CHARS {
        return Err(ClientError::Validation(format!(
            "message content is {} characters, the limit is {}",
            chars, MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}
