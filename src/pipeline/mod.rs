//! Per-connection duplex handler pipeline
//!
//! A pipeline is an ordered chain of handlers between the application
//! and the wire: index 0 sits next to the application, the last handler
//! next to the socket. Application writes flow front-to-back, wire reads
//! flow back-to-front. A handshake handler may intercept and buffer
//! traffic until its setup completes, then remove itself; its buffered
//! FIFO is flushed through the rest of the chain at that point, so no
//! write is ever dropped or reordered.

pub mod http_connect;

use crate::Result;
use bytes::BytesMut;
use std::fmt;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Greeting,
    AddressNegotiation,
    OutboundConnecting,
    OutboundHandshake,
    Tunneling,
    Closed,
}

impl ConnState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Greeting, AddressNegotiation)
                | (AddressNegotiation, OutboundConnecting)
                | (OutboundConnecting, OutboundHandshake)
                | (OutboundHandshake, Tunneling)
                | (_, Closed)
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Greeting => "greeting",
            ConnState::AddressNegotiation => "addr-negotiation",
            ConnState::OutboundConnecting => "out-connecting",
            ConnState::OutboundHandshake => "out-handshake",
            ConnState::Tunneling => "tunneling",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What a handler produced from one event.
#[derive(Default)]
pub struct HandlerOutput {
    /// Decoded payload surfaced toward the application.
    pub inbound: BytesMut,
    /// Wire bytes to be sent toward the socket.
    pub outbound: BytesMut,
}

impl HandlerOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Directive returned by a handler after each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// Stay in the chain.
    Continue,
    /// Handshake complete: drop this handler; queued events were already
    /// emitted through `HandlerOutput` in FIFO order.
    Remove,
}

/// One element of the duplex chain.
pub trait DuplexHandler: Send {
    /// Called once when the pipeline is attached to a live connection.
    fn on_active(&mut self, _out: &mut HandlerOutput) -> Result<HandlerAction> {
        Ok(HandlerAction::Continue)
    }

    /// Bytes arriving from the wire side.
    fn on_read(&mut self, data: &[u8], out: &mut HandlerOutput) -> Result<HandlerAction>;

    /// A write submitted from the application side.
    fn on_write(&mut self, data: &[u8], out: &mut HandlerOutput) -> Result<HandlerAction>;
}

/// The driver owning the chain.
pub struct Pipeline {
    handlers: Vec<Box<dyn DuplexHandler>>,
    state: ConnState,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            handlers: Vec::new(),
            state: ConnState::Greeting,
        }
    }

    pub fn push(&mut self, handler: Box<dyn DuplexHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, next: ConnState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(crate::Error::framing(format!(
                "illegal state transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Activate every handler front-to-back, collecting initial wire
    /// bytes (e.g. a CONNECT request emitted on attach).
    pub fn activate(&mut self) -> Result<Vec<u8>> {
        let mut wire = Vec::new();
        let mut idx = 0;
        while idx < self.handlers.len() {
            let mut out = HandlerOutput::new();
            let action = self.handlers[idx].on_active(&mut out)?;
            // Route this handler's outbound through the handlers behind it
            let produced = self.route_outbound(idx + 1, &out.outbound)?;
            wire.extend_from_slice(&produced);
            match action {
                HandlerAction::Continue => idx += 1,
                HandlerAction::Remove => {
                    self.handlers.remove(idx);
                }
            }
        }
        Ok(wire)
    }

    /// Submit an application write; returns the wire bytes to send.
    pub fn write(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.route_outbound(0, data)
    }

    /// Feed wire bytes; returns (application payload, wire bytes to send).
    ///
    /// Wire bytes appear when a handshake handler answers or, on
    /// completion, flushes its buffered FIFO.
    pub fn read(&mut self, data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        self.route_inbound(data)
    }

    fn route_outbound(&mut self, from: usize, data: &[u8]) -> Result<Vec<u8>> {
        let mut current = data.to_vec();
        let mut idx = from;
        while idx < self.handlers.len() {
            if current.is_empty() {
                // Nothing left to push down the chain
                return Ok(Vec::new());
            }
            let mut out = HandlerOutput::new();
            let action = self.handlers[idx].on_write(&current, &mut out)?;
            current = out.outbound.to_vec();
            match action {
                HandlerAction::Continue => idx += 1,
                HandlerAction::Remove => {
                    self.handlers.remove(idx);
                }
            }
        }
        Ok(current)
    }

    fn route_inbound(&mut self, data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut payload = data.to_vec();
        let mut wire = Vec::new();
        let mut idx = self.handlers.len();
        while idx > 0 {
            idx -= 1;
            if payload.is_empty() && wire.is_empty() {
                break;
            }
            let mut out = HandlerOutput::new();
            let action = self.handlers[idx].on_read(&payload, &mut out)?;
            // Outbound produced while reading (handshake replies, flushed
            // FIFO) is routed through the handlers behind this one.
            let produced = match action {
                HandlerAction::Continue => self.route_outbound(idx + 1, &out.outbound)?,
                HandlerAction::Remove => {
                    self.handlers.remove(idx);
                    self.route_outbound(idx, &out.outbound)?
                }
            };
            wire.extend_from_slice(&produced);
            payload = out.inbound.to_vec();
        }
        Ok((payload, wire))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
