//! Socket client tying framing, transport and dispatch together.
//!
//! Everything runs on the thread that drives the host event loop. Blocking
//! waits poll the transport in short slices and pump the host's events in
//! between, so the host stays responsive and inbound calls from the peer are
//! served while a reply is outstanding.

use crate::codec::{CodecError, FrameCodec};
use crate::dispatcher::{CallbackResult, Dispatcher};
use crate::protocol::{Message, Params, RemoteError, RequestId};
use crate::transport::{ConnectionState, TcpOptions, TcpTransport, Transport, TransportError};
use harmony_core::{BridgeConfig, Endpoint, TextEncoding};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("peer returned an error for {method}: {error}")]
    Remote { method: String, error: RemoteError },
}

/// Host hook run while waiting on the peer.
pub type EventPump = Rc<dyn Fn()>;

/// Client tuning, usually derived from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Default wait for [`BridgeClient::call_and_wait`].
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub result_ttl: Duration,
    pub outbound_encoding: TextEncoding,
    pub inbound_encoding: TextEncoding,
    pub max_frame_len: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

impl ClientOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            poll_interval: config.poll_interval(),
            result_ttl: config.result_ttl(),
            outbound_encoding: config.outbound_encoding,
            inbound_encoding: config.inbound_encoding,
            max_frame_len: config.max_frame_bytes,
        }
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::with_encodings(self.outbound_encoding, self.inbound_encoding)
            .with_max_frame_len(self.max_frame_len)
    }
}

/// Restores the "currently receiving" flag when a receive pass ends.
struct ReceivingGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> ReceivingGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for ReceivingGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// Removes a waiter's reply from the pending table however the wait ends.
struct PendingSlot<'a> {
    dispatcher: &'a Dispatcher,
    id: &'a RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.dispatcher.take_result(self.id);
    }
}

/// Connection to the peer application.
///
/// Not `Send`: all use happens on the host's event-loop thread. Methods take
/// `&self` so callbacks can call back into the client while it is
/// dispatching.
pub struct BridgeClient {
    options: ClientOptions,
    transport: RefCell<Box<dyn Transport>>,
    codec: RefCell<FrameCodec>,
    inbox: RefCell<VecDeque<Message>>,
    dispatcher: Dispatcher,
    receiving: Cell<bool>,
    event_pump: RefCell<Option<EventPump>>,
}

impl BridgeClient {
    /// Client for the peer at `endpoint`. Does not connect yet.
    pub fn tcp(endpoint: &Endpoint, config: &BridgeConfig) -> Self {
        let transport = TcpTransport::new(
            endpoint.host.clone(),
            endpoint.port,
            TcpOptions {
                connect_timeout: config.connect_timeout(),
                write_timeout: config.write_timeout(),
            },
        );
        Self::with_transport(Box::new(transport), ClientOptions::from_config(config))
    }

    pub fn with_transport(transport: Box<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            codec: RefCell::new(options.codec()),
            dispatcher: Dispatcher::new(options.result_ttl),
            options,
            transport: RefCell::new(transport),
            inbox: RefCell::new(VecDeque::new()),
            receiving: Cell::new(false),
            event_pump: RefCell::new(None),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Open a fresh connection, dropping any existing one. Does not retry.
    pub fn connect(&self) -> Result<ConnectionState, BridgeError> {
        tracing::debug!("connecting to server");
        self.transport.borrow_mut().connect()?;
        self.codec.borrow_mut().reset();
        let state = self.state();
        tracing::debug!(%state, "server status");
        Ok(state)
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.borrow().state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.borrow().is_connected()
    }

    /// Drop the connection without a graceful shutdown.
    pub fn close(&self) {
        self.transport.borrow_mut().abort();
        self.codec.borrow_mut().reset();
    }

    /// Serve `method` calls from the peer with `callback`.
    pub fn register_callback<F>(&self, method: impl Into<String>, callback: F)
    where
        F: Fn(&BridgeClient, &Params) -> CallbackResult + 'static,
    {
        self.dispatcher.register(method, Rc::new(callback));
    }

    pub fn unregister_callback(&self, method: &str) -> bool {
        self.dispatcher.unregister(method)
    }

    pub fn registered_methods(&self) -> Vec<String> {
        self.dispatcher.methods()
    }

    /// Install the hook pumped while waiting for replies.
    pub fn set_event_pump<F>(&self, pump: F)
    where
        F: Fn() + 'static,
    {
        *self.event_pump.borrow_mut() = Some(Rc::new(pump));
    }

    pub fn clear_event_pump(&self) {
        self.event_pump.borrow_mut().take();
    }

    /// Number of replies received but not collected yet.
    pub fn pending_results(&self) -> usize {
        self.dispatcher.pending_len()
    }

    /// Send a call. With `expect_reply` unset the peer never answers it.
    pub fn call(
        &self,
        method: &str,
        params: Params,
        expect_reply: bool,
    ) -> Result<RequestId, BridgeError> {
        let message = Message::call(method, params, expect_reply);
        let id = message.id().clone();
        let started = Instant::now();
        self.send_message(&message)?;
        tracing::debug!(
            method,
            %id,
            expect_reply,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sent command"
        );
        Ok(id)
    }

    /// Fire-and-forget call.
    pub fn notify(&self, method: &str, params: Params) -> Result<RequestId, BridgeError> {
        self.call(method, params, false)
    }

    /// Call `method` and wait up to the default read timeout for its reply.
    ///
    /// `Ok(None)` means no reply arrived in time; callers should treat it as
    /// "unknown" rather than as a failure.
    pub fn call_and_wait(
        &self,
        method: &str,
        params: Params,
    ) -> Result<Option<Value>, BridgeError> {
        self.call_and_wait_timeout(method, params, self.options.read_timeout)
    }

    pub fn call_and_wait_timeout(
        &self,
        method: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Option<Value>, BridgeError> {
        self.pump_events();

        let started = Instant::now();
        let deadline = started + timeout;
        let id = self.call(method, params, true)?;
        let _slot = PendingSlot {
            dispatcher: &self.dispatcher,
            id: &id,
        };
        let _receiving = ReceivingGuard::enter(&self.receiving);

        tracing::debug!(method, %id, "waiting to receive data");
        let outcome = loop {
            if let Some(outcome) = self.dispatcher.take_result(&id) {
                break Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let slice = (deadline - now).min(self.options.poll_interval);
            if let Err(e) = self.receive_pass(slice) {
                // the reply may have arrived just ahead of the failure
                match self.dispatcher.take_result(&id) {
                    Some(outcome) => break Some(outcome),
                    None => return Err(e),
                }
            }
            self.pump_events();
        };
        self.pump_events();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Some(Ok(value)) => {
                tracing::debug!(method, %id, elapsed_ms, "received reply");
                Ok(Some(value))
            }
            Some(Err(error)) => Err(BridgeError::Remote {
                method: method.to_string(),
                error,
            }),
            None => {
                tracing::warn!(method, %id, elapsed_ms, "did not receive any reply");
                Ok(None)
            }
        }
    }

    /// Sleep for `duration` in poll-interval slices, pumping host events
    /// between them. For waits where nothing can be read yet, such as the
    /// pause between connect attempts.
    pub fn wait(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        self.pump_events();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(self.options.poll_interval));
            self.pump_events();
        }
    }

    /// Answer a call received from the peer.
    pub fn reply(&self, id: RequestId, result: Value) -> Result<(), BridgeError> {
        self.send_message(&Message::reply(id, result))
    }

    /// Wait up to `timeout` for data, then dispatch every complete message
    /// that has arrived. Returns how many messages were dispatched.
    ///
    /// A trailing partial frame stays buffered for the next pass.
    pub fn receive_available(&self, timeout: Duration) -> Result<usize, BridgeError> {
        let _receiving = ReceivingGuard::enter(&self.receiving);
        self.receive_pass(timeout)
    }

    /// Entry point for the host's "data ready" notification. Does nothing
    /// while another receive pass is running on this thread.
    pub fn poll(&self, timeout: Duration) -> Result<usize, BridgeError> {
        if self.receiving.get() {
            tracing::trace!("receive already in progress, skipping poll");
            return Ok(0);
        }
        self.receive_available(timeout)
    }

    fn receive_pass(&self, timeout: Duration) -> Result<usize, BridgeError> {
        let outcome = self.transport.borrow_mut().read_available(timeout)?;

        if !outcome.bytes.is_empty() {
            tracing::trace!(len = outcome.bytes.len(), "receiving data");
            let decoded = self.codec.borrow_mut().decode_stream(&outcome.bytes);
            match decoded {
                Ok(messages) => self.inbox.borrow_mut().extend(messages),
                Err(lost) => {
                    tracing::error!(
                        error = %lost,
                        salvaged = lost.decoded.len(),
                        "framing lost, dropping connection"
                    );
                    self.inbox.borrow_mut().extend(lost.decoded);
                    self.drain_inbox();
                    self.close();
                    return Err(lost.source.into());
                }
            }
        }
        if outcome.closed {
            self.codec.borrow_mut().reset();
        }

        Ok(self.drain_inbox())
    }

    fn drain_inbox(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let next = self.inbox.borrow_mut().pop_front();
            let Some(message) = next else {
                break;
            };
            dispatched += 1;

            let Some(reply) = self.dispatcher.dispatch(self, message) else {
                continue;
            };
            match self.send_message(&reply) {
                Ok(()) => tracing::debug!(id = %reply.id(), "sent back result"),
                Err(e) => tracing::error!(id = %reply.id(), error = %e, "failed to send reply"),
            }
        }
        dispatched
    }

    fn send_message(&self, message: &Message) -> Result<(), BridgeError> {
        let frame = self.codec.borrow().encode(message)?;

        let mut transport = self.transport.borrow_mut();
        if !transport.is_connected() {
            tracing::debug!("not connected, connecting before send");
            transport.connect()?;
            self.codec.borrow_mut().reset();
        }
        if let Err(e) = transport.send(&frame) {
            tracing::error!(error = %e, "could not write to socket");
            return Err(e.into());
        }
        Ok(())
    }

    fn pump_events(&self) {
        let pump = self.event_pump.borrow().clone();
        if let Some(pump) = pump {
            pump();
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.transport.get_mut().abort();
    }
}
