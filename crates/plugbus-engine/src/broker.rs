//! The dispatch engine.
//!
//! A [`Broker`] owns all cross-connection state: which key each connection
//! authenticated as, the correlation table and the subscription registry.
//! It is driven by exactly one task, so every method takes `&mut self` and
//! runs to completion without suspending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn, Span};

use plugbus_core::{ConnectionId, Message, PluginKey, Value};
use plugbus_store::PluginStore;

use crate::correlation::{CorrelationError, CorrelationTable, PendingCall};
use crate::error::DispatchError;
use crate::gate::AuthorizationGate;
use crate::params::{self, Method};
use crate::random::{CallIdSource, OsCallIds};
use crate::subscriptions::SubscriptionRegistry;

/// Attempts at drawing an unused call id before giving up.
const CALL_ID_ATTEMPTS: usize = 8;

/// Work for the transport. Applied in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Send { target: ConnectionId, message: Message },
    Close { target: ConnectionId },
}

impl Outbound {
    pub fn send(target: &ConnectionId, message: Message) -> Self {
        Self::Send {
            target: target.clone(),
            message,
        }
    }

    #[cfg(test)]
    pub(crate) fn target(&self) -> &ConnectionId {
        match self {
            Self::Send { target, .. } | Self::Close { target } => target,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub connections: usize,
    pub authenticated: usize,
    pub pending_calls: usize,
    pub subscriptions: usize,
}

#[derive(Clone, Copy, Debug)]
enum Session {
    AwaitingHandshake,
    Authenticated(PluginKey),
}

pub struct Broker {
    gate: AuthorizationGate,
    ids: Box<dyn CallIdSource>,
    call_timeout: Option<Duration>,
    sessions: HashMap<ConnectionId, Session>,
    routes: HashMap<PluginKey, ConnectionId>,
    calls: CorrelationTable,
    subscriptions: SubscriptionRegistry,
}

impl Broker {
    pub fn new(store: Arc<dyn PluginStore>) -> Self {
        Self {
            gate: AuthorizationGate::new(store),
            ids: Box::new(OsCallIds),
            call_timeout: None,
            sessions: HashMap::new(),
            routes: HashMap::new(),
            calls: CorrelationTable::new(),
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    /// Give every forwarded call a deadline.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_call_ids(mut self, ids: impl CallIdSource + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.sessions.len(),
            authenticated: self.routes.len(),
            pending_calls: self.calls.len(),
            subscriptions: self.subscriptions.len(),
        }
    }

    /// Key the connection authenticated as, if any.
    #[cfg(test)]
    pub(crate) fn plugin_key(&self, conn: &ConnectionId) -> Option<PluginKey> {
        match self.sessions.get(conn) {
            Some(Session::Authenticated(key)) => Some(*key),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_calls(&self) -> &CorrelationTable {
        &self.calls
    }

    #[cfg(test)]
    pub(crate) fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn on_connection_opened(&mut self, conn: ConnectionId) {
        debug!(conn_id = %conn, "connection opened");
        self.sessions.insert(conn, Session::AwaitingHandshake);
    }

    /// Route one inbound message from `sender`.
    #[instrument(skip_all, fields(conn_id = %sender, plugin_key = tracing::field::Empty))]
    pub fn dispatch(&mut self, sender: &ConnectionId, message: Message, now: Instant) -> Vec<Outbound> {
        let key = match self.sessions.get(sender) {
            None => {
                warn!("message from unknown connection dropped");
                return Vec::new();
            }
            Some(Session::AwaitingHandshake) => return self.handshake(sender, message),
            Some(Session::Authenticated(key)) => *key,
        };
        Span::current().record("plugin_key", key.fingerprint().as_str());

        match message {
            Message::Request {
                call_id,
                method,
                params,
            } => match self.route(sender, &key, Some(call_id), &method, params, now) {
                Ok(out) => out,
                Err(e) => {
                    warn!(call_id, method = %method, error = %e, "request rejected");
                    vec![Outbound::send(sender, Message::failure(call_id, e.to_value()))]
                }
            },
            Message::Notification { method, params } => {
                match self.route(sender, &key, None, &method, params, now) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(method = %method, error = %e, "notification rejected");
                        Vec::new()
                    }
                }
            }
            Message::Response {
                call_id,
                error,
                result,
            } => {
                if let Err(e) = self.gate.verify_identity(&key) {
                    warn!(call_id, error = %e, "response rejected");
                    return Vec::new();
                }
                match self.complete_call(&key, call_id, error, result) {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(call_id, error = %e, "result dropped");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// First frame on a connection must be `connect` carrying the plugin key.
    /// Anything else is answered (when possible) and the connection closed.
    fn handshake(&mut self, sender: &ConnectionId, message: Message) -> Vec<Outbound> {
        let reject = |request_id: Option<u64>, err: DispatchError| {
            warn!(error = %err, "handshake rejected");
            let mut out = Vec::with_capacity(2);
            if let Some(id) = request_id {
                out.push(Outbound::send(sender, Message::failure(id, err.to_value())));
            }
            out.push(Outbound::Close {
                target: sender.clone(),
            });
            out
        };

        let (request_id, params) = match message {
            Message::Request {
                call_id,
                method,
                params,
            } if Method::parse(&method) == Some(Method::Connect) => (call_id, params),
            other => {
                return reject(
                    other.call_id(),
                    DispatchError::Authorization("connection has not completed the handshake".into()),
                )
            }
        };

        let key = match params::parse_connect(params) {
            Ok(key) => key,
            Err(e) => return reject(Some(request_id), e),
        };
        if let Err(e) = self.gate.verify_identity(&key) {
            return reject(Some(request_id), e);
        }
        if self.routes.contains_key(&key) {
            return reject(
                Some(request_id),
                DispatchError::Authorization("plugin key is already connected".into()),
            );
        }

        Span::current().record("plugin_key", key.fingerprint().as_str());
        info!("plugin connected");
        self.sessions.insert(sender.clone(), Session::Authenticated(key));
        self.routes.insert(key, sender.clone());
        vec![Outbound::send(sender, Message::success(request_id, Value::Array(Vec::new())))]
    }

    fn route(
        &mut self,
        sender: &ConnectionId,
        key: &PluginKey,
        request_id: Option<u64>,
        method: &str,
        params: Vec<Value>,
        now: Instant,
    ) -> Result<Vec<Outbound>, DispatchError> {
        self.gate.verify_identity(key)?;
        let method = Method::parse(method)
            .ok_or_else(|| DispatchError::validation(format!("unknown method `{method}`")))?;

        let ack = |result: Value| -> Vec<Outbound> {
            request_id
                .map(|id| Outbound::send(sender, Message::success(id, result)))
                .into_iter()
                .collect()
        };

        match method {
            Method::Connect => Err(DispatchError::validation("connection is already authenticated")),
            Method::Register => {
                let manifest = params::parse_register(params)?;
                self.gate.register(key, &manifest)?;
                info!(name = %manifest.name, functions = manifest.functions.len(), "plugin registered");
                Ok(ack(Value::Array(Vec::new())))
            }
            Method::Run => {
                let request_id = request_id
                    .ok_or_else(|| DispatchError::validation("`run` must be sent as a request"))?;
                self.run(sender, request_id, params, now)
            }
            Method::Result => {
                let parsed = params::parse_result(params)?;
                let result = Some(Value::Array(parsed.args));
                match self.complete_call(key, parsed.call_id, None, result) {
                    Ok(mut out) => {
                        out.extend(ack(Value::Array(Vec::new())));
                        Ok(out)
                    }
                    Err(e) => {
                        warn!(call_id = parsed.call_id, error = %e, "result dropped");
                        Err(DispatchError::Routing(e.to_string()))
                    }
                }
            }
            Method::Broadcast => {
                let parsed = params::parse_broadcast(params)?;
                Ok(self.broadcast(parsed.event, parsed.args))
            }
            Method::Subscribe => {
                let parsed = params::parse_subscription(params, method)?;
                if self.subscriptions.subscribe(&parsed.event, *key) {
                    debug!(event = %parsed.event, "subscribed");
                }
                Ok(ack(Value::Array(vec![parsed.id])))
            }
            Method::Unsubscribe => {
                let parsed = params::parse_subscription(params, method)?;
                if self.subscriptions.unsubscribe(&parsed.event, key) {
                    debug!(event = %parsed.event, "unsubscribed");
                }
                Ok(ack(Value::Array(vec![parsed.id])))
            }
        }
    }

    fn run(
        &mut self,
        sender: &ConnectionId,
        request_id: u64,
        params: Vec<Value>,
        now: Instant,
    ) -> Result<Vec<Outbound>, DispatchError> {
        let run = params::parse_run(params)?;
        self.gate.verify_function(&run.target, &run.function, &run.args)?;

        let callee_conn = self
            .routes
            .get(&run.target)
            .cloned()
            .ok_or_else(|| DispatchError::Routing(format!("plugin {} is not connected", run.target.fingerprint())))?;

        let mut pending = PendingCall {
            call_id: 0,
            caller: sender.clone(),
            caller_request_id: request_id,
            callee_key: run.target,
            created_at: now,
            deadline: self.call_timeout.map(|t| now + t),
        };
        let mut inserted = false;
        for _ in 0..CALL_ID_ATTEMPTS {
            pending.call_id = self.ids.next_call_id();
            match self.calls.insert(pending.clone()) {
                Ok(()) => {
                    inserted = true;
                    break;
                }
                Err(CorrelationError::Duplicate(id)) => warn!(call_id = id, "call id collision"),
                Err(e) => return Err(DispatchError::Internal(e.to_string())),
            }
        }
        if !inserted {
            return Err(DispatchError::Internal("could not allocate a call id".into()));
        }

        let call_id = pending.call_id;
        debug!(call_id, function = %run.function, callee = %run.target.fingerprint(), "call forwarded");
        let forwarded = Message::request(
            call_id,
            Method::Run.as_str(),
            vec![
                Value::Array(vec![Value::Nil, Value::from(call_id)]),
                Value::from(run.function),
                Value::Array(run.args),
            ],
        );
        Ok(vec![Outbound::send(&callee_conn, forwarded)])
    }

    /// Match a result against its pending call and route it to the caller
    /// under the caller's original msgid.
    fn complete_call(
        &mut self,
        responder: &PluginKey,
        call_id: u64,
        error: Option<Value>,
        result: Option<Value>,
    ) -> Result<Vec<Outbound>, CorrelationError> {
        let call = self.calls.complete(call_id, responder)?;
        debug!(call_id, "call completed");
        let response = Message::Response {
            call_id: call.caller_request_id,
            error,
            result,
        };
        Ok(vec![Outbound::send(&call.caller, response)])
    }

    fn broadcast(&self, event: String, args: Vec<Value>) -> Vec<Outbound> {
        let subscribers = self.subscriptions.subscribers(&event);
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::from(event.as_str()));
        params.extend(args);

        let mut out = Vec::with_capacity(subscribers.len());
        for key in subscribers {
            match self.routes.get(&key) {
                Some(conn) => out.push(Outbound::send(conn, Message::notification("broadcast", params.clone()))),
                None => debug!(event = %event, subscriber = %key.fingerprint(), "subscriber offline, skipped"),
            }
        }
        debug!(event = %event, delivered = out.len(), "broadcast");
        out
    }

    /// Forget a connection. Calls it was serving are failed back to their
    /// callers; calls it was waiting on are dropped.
    #[instrument(skip_all, fields(conn_id = %conn))]
    pub fn on_connection_closed(&mut self, conn: &ConnectionId) -> Vec<Outbound> {
        let Some(session) = self.sessions.remove(conn) else {
            return Vec::new();
        };
        let Session::Authenticated(key) = session else {
            debug!("unauthenticated connection closed");
            return Vec::new();
        };
        if self.routes.get(&key) == Some(conn) {
            self.routes.remove(&key);
        }

        let unsubscribed = self.subscriptions.remove_key(&key);
        let dropped = self.calls.remove_for_caller(conn);
        let orphaned = self.calls.remove_for_callee(&key);
        info!(
            plugin_key = %key.fingerprint(),
            unsubscribed,
            dropped = dropped.len(),
            orphaned = orphaned.len(),
            "plugin disconnected"
        );

        self.fail_calls(orphaned, DispatchError::Orphaned)
    }

    /// Fail every call whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Outbound> {
        let expired = self.calls.expire(now);
        if !expired.is_empty() {
            warn!(count = expired.len(), "pending calls expired");
        }
        self.fail_calls(expired, DispatchError::Expired)
    }

    fn fail_calls(&self, calls: Vec<PendingCall>, reason: fn(u64) -> DispatchError) -> Vec<Outbound> {
        calls
            .into_iter()
            .filter(|call| self.sessions.contains_key(&call.caller))
            .map(|call| {
                let err = reason(call.call_id);
                Outbound::send(&call.caller, Message::failure(call.caller_request_id, err.to_value()))
            })
            .collect()
    }
}
