//! Request/response correlation and event fan-out.
//!
//! Tracks outgoing requests by `seq`, routes responses to waiting callers
//! via oneshot channels, and fans events out to subscribed listeners. All
//! state here is connection-scoped; [`Dispatcher::close`] tears it down and
//! fails anything still pending.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::DapError;
use crate::protocol::{Event, Message, Request, Response};

/// How many recently seen messages to keep for diagnostics.
const RECENT_MESSAGE_CAPACITY: usize = 100;

/// A callback invoked with an event's body.
pub type EventCallback = Arc<dyn Fn(Option<serde_json::Value>) + Send + Sync>;

/// Handle for removing a registered event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Shared slot holding a one-shot waiter's sender until it fires.
type WaiterSlot = Arc<Mutex<Option<oneshot::Sender<Option<serde_json::Value>>>>>;

struct Subscription {
    id: ListenerId,
    once: bool,
    /// Present for one-shot waiters; lets the dispatcher see whether the
    /// receiving side is still around.
    waiter: Option<WaiterSlot>,
    callback: EventCallback,
}

impl Subscription {
    /// A one-shot entry whose receiver has been dropped can never deliver.
    fn is_stale(&self) -> bool {
        match &self.waiter {
            Some(slot) => slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map_or(true, |tx| tx.is_closed()),
            None => false,
        }
    }
}

/// Correlation state for one connection.
pub struct Dispatcher {
    pending: HashMap<i64, oneshot::Sender<Response>>,
    events: HashMap<String, Vec<Subscription>>,
    inbound: HashSet<i64>,
    recent: VecDeque<Message>,
    next_listener_id: u64,
    closed: bool,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            events: HashMap::new(),
            inbound: HashSet::new(),
            recent: VecDeque::with_capacity(RECENT_MESSAGE_CAPACITY),
            next_listener_id: 1,
            closed: false,
        }
    }

    /// How many outgoing requests are awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Recently seen messages, oldest first. Purely observational.
    pub fn recent_messages(&self) -> impl Iterator<Item = &Message> {
        self.recent.iter()
    }

    fn record(&mut self, message: Message) {
        if self.recent.len() == RECENT_MESSAGE_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(message);
    }

    /// Register an outgoing request and return the slot its response will
    /// resolve. A `seq` that is already pending is a protocol violation and
    /// fails fast rather than overwriting the first registration.
    pub fn register_request(
        &mut self,
        request: &Request,
    ) -> Result<oneshot::Receiver<Response>, DapError> {
        if self.closed {
            return Err(DapError::ConnectionClosed);
        }
        if self.pending.contains_key(&request.seq) {
            return Err(DapError::Protocol(format!(
                "duplicate outgoing request seq {}",
                request.seq
            )));
        }
        self.record(Message::Request(request.clone()));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.seq, tx);
        Ok(rx)
    }

    /// Resolve the pending request matching `response.request_seq`.
    ///
    /// A response with no matching pending entry is a protocol violation;
    /// the caller decides whether that is fatal (the receive loop logs and
    /// drops it).
    pub fn resolve_response(&mut self, response: Response) -> Result<(), DapError> {
        self.record(Message::Response(response.clone()));
        let sender = self.pending.remove(&response.request_seq).ok_or_else(|| {
            DapError::Protocol(format!(
                "response for unknown request_seq {}",
                response.request_seq
            ))
        })?;
        // The awaiting caller may have abandoned the receiver; that is fine.
        let _ = sender.send(response);
        Ok(())
    }

    /// Track an inbound request (server role) and create the slot the
    /// handler will fulfill with the eventual outgoing response.
    ///
    /// Returns both halves: the sender goes to whatever handles the
    /// request, the receiver to whatever writes the reply to the wire.
    pub fn accept_request(
        &mut self,
        request: &Request,
    ) -> Result<(oneshot::Sender<Response>, oneshot::Receiver<Response>), DapError> {
        if self.closed {
            return Err(DapError::ConnectionClosed);
        }
        if !self.inbound.insert(request.seq) {
            return Err(DapError::Protocol(format!(
                "duplicate inbound request seq {}",
                request.seq
            )));
        }
        self.record(Message::Request(request.clone()));
        Ok(oneshot::channel())
    }

    /// Stop tracking an inbound request once its response has been written.
    pub fn finish_inbound(&mut self, seq: i64) {
        self.inbound.remove(&seq);
    }

    /// Register a persistent listener for the named event. On a closed
    /// dispatcher this is a no-op; the returned id refers to nothing.
    pub fn subscribe(&mut self, event: &str, callback: EventCallback) -> ListenerId {
        self.subscribe_entry(event, callback, false, None)
    }

    /// Register a one-shot waiter for the named event. The returned
    /// receiver resolves with the body of the first matching event; the
    /// listener unsubscribes itself when it fires. On a closed dispatcher
    /// the receiver fails immediately rather than waiting forever.
    pub fn subscribe_once(&mut self, event: &str) -> oneshot::Receiver<Option<serde_json::Value>> {
        let (tx, rx) = oneshot::channel();
        if self.closed {
            // Dropping the sender fails the receiver on first poll.
            return rx;
        }
        let slot: WaiterSlot = Arc::new(Mutex::new(Some(tx)));
        let fire = slot.clone();
        self.subscribe_entry(
            event,
            Arc::new(move |body| {
                if let Some(tx) = fire.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(body);
                }
            }),
            true,
            Some(slot),
        );
        rx
    }

    fn subscribe_entry(
        &mut self,
        event: &str,
        callback: EventCallback,
        once: bool,
        waiter: Option<WaiterSlot>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        if self.closed {
            return id;
        }
        let subs = self.events.entry(event.to_string()).or_default();
        // Abandoned waiters would otherwise sit here until the event fires.
        subs.retain(|s| !s.is_stale());
        subs.push(Subscription {
            id,
            once,
            waiter,
            callback,
        });
        id
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn unsubscribe(&mut self, event: &str, id: ListenerId) -> bool {
        match self.events.get_mut(event) {
            Some(subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            }
            None => false,
        }
    }

    /// Look up the callbacks for an event, in registration order, removing
    /// one-shot entries.
    ///
    /// The callbacks are returned rather than invoked so the caller can run
    /// them without holding the dispatcher lock; a callback may therefore
    /// subscribe or unsubscribe (including itself) without corrupting
    /// iteration. No listeners is not an error.
    pub fn dispatch_event(&mut self, event: &Event) -> Vec<EventCallback> {
        self.record(Message::Event(event.clone()));
        let Some(subs) = self.events.get_mut(&event.event) else {
            return Vec::new();
        };
        subs.retain(|s| !s.is_stale());
        let callbacks: Vec<EventCallback> = subs.iter().map(|s| s.callback.clone()).collect();
        subs.retain(|s| !s.once);
        if subs.is_empty() {
            self.events.remove(&event.event);
        }
        callbacks
    }

    /// Tear down all connection-scoped state.
    ///
    /// Every pending request slot and one-shot event waiter is dropped, so
    /// in-flight callers observe a connection-closed condition instead of
    /// hanging forever. Subsequent registrations fail.
    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.inbound.clear();
        self.events.clear();
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
