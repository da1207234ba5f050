//! Session layer: sequenced calls and the initialization handshake.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::capabilities::DapCapabilities;
use crate::connection::Connection;
use crate::dispatcher::{EventCallback, ListenerId};
use crate::error::DapError;
use crate::protocol::{Capabilities, InitializeRequestArguments, Request, Response};

/// Identifier this client reports in the `initialize` request.
const CLIENT_ID: &str = "burrow";

/// A DAP session over one connection.
///
/// Owns the outgoing sequence counter (instance-scoped, starting at 1) and
/// the capability flags recorded from the `initialize` response. Multiple
/// sessions in one process do not interfere with each other's numbering.
pub struct DapClient {
    connection: Connection,
    next_seq: AtomicI64,
    adapter_id: String,
    capabilities: Mutex<DapCapabilities>,
}

/// A call whose request is on the wire but whose response has not been
/// awaited yet. The handshake uses this to keep `attach` in flight while
/// other steps run.
pub struct PendingCall {
    seq: i64,
    command: String,
    rx: oneshot::Receiver<Response>,
}

/// An in-flight wait for a named event, registered at creation time.
pub struct EventWaiter {
    rx: oneshot::Receiver<Option<serde_json::Value>>,
}

impl DapClient {
    /// Create a session over an established connection.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            next_seq: AtomicI64::new(1),
            adapter_id: CLIENT_ID.to_string(),
            capabilities: Mutex::new(DapCapabilities::default()),
        }
    }

    /// Override the adapter ID sent in `initialize`.
    pub fn with_adapter_id(mut self, adapter_id: impl Into<String>) -> Self {
        self.adapter_id = adapter_id.into();
        self
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Capability flags recorded from the `initialize` response.
    pub fn capabilities(&self) -> DapCapabilities {
        self.capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Issue a request and return it in flight, without waiting for the
    /// response.
    pub async fn start_call(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<PendingCall, DapError> {
        let request = Request {
            seq: self.next_seq(),
            command: command.to_string(),
            arguments,
        };
        let seq = request.seq;
        let rx = self.connection.send_request(request).await?;
        Ok(PendingCall {
            seq,
            command: command.to_string(),
            rx,
        })
    }

    /// Issue a request, await its response, and unwrap the result: the
    /// body on success, a [`DapError::Rejected`] carrying the adapter's
    /// message plus any extra detail fields on failure.
    pub async fn remote_call(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, DapError> {
        self.start_call(command, arguments).await?.finish().await
    }

    /// Begin waiting for the named event. The subscription is registered
    /// before this returns, so an event firing between this call and the
    /// eventual [`EventWaiter::wait`] is not lost.
    pub fn wait_for_event(&self, event: &str) -> EventWaiter {
        EventWaiter {
            rx: self.connection.subscribe_once(event),
        }
    }

    /// Register a persistent listener for the named event.
    pub fn add_event_listener(&self, event: &str, callback: EventCallback) -> ListenerId {
        self.connection.add_event_listener(event, callback)
    }

    /// Remove a previously registered listener.
    pub fn remove_event_listener(&self, event: &str, id: ListenerId) -> bool {
        self.connection.remove_event_listener(event, id)
    }

    /// Run the session-initialization handshake.
    ///
    /// The order is fixed by the protocol: the adapter emits `initialized`
    /// only after it receives `attach`, expects `configurationDone` (when
    /// supported) after `initialized`, and answers `attach` only after
    /// `configurationDone` has been processed. The attach call therefore
    /// stays in flight across the intermediate steps instead of being
    /// awaited naively in sequence.
    pub async fn initialize_session(
        &self,
        attach_arguments: Option<serde_json::Value>,
    ) -> Result<(), DapError> {
        // 1. Subscribe before anything is sent, so the event cannot fire
        //    before the subscription exists.
        let initialized = self.wait_for_event("initialized");

        // 2. initialize; record capability flags from the response body.
        let arguments = InitializeRequestArguments {
            client_id: Some(CLIENT_ID.into()),
            client_name: Some(CLIENT_ID.into()),
            adapter_id: self.adapter_id.clone(),
            locale: Some("en-US".into()),
            lines_start_at1: Some(true),
            columns_start_at1: Some(true),
            path_format: Some("path".into()),
        };
        let arguments = serde_json::to_value(arguments)
            .map_err(|e| DapError::InvalidMessage(e.to_string()))?;
        let body = self.remote_call("initialize", Some(arguments)).await?;
        let caps: Capabilities = match body {
            Some(body) => serde_json::from_value(body)
                .map_err(|e| DapError::InvalidMessage(format!("initialize body: {e}")))?,
            None => Capabilities::default(),
        };
        let resolved = DapCapabilities::from_initialize_response(&caps);
        let configuration_done = resolved.supports_configuration_done_request;
        *self
            .capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = resolved;

        // 3. attach, left in flight.
        let attach = self.start_call("attach", attach_arguments).await?;

        // 4. Wait for the initialized event.
        initialized.wait().await?;

        // 5. configurationDone, if the adapter supports it.
        if configuration_done {
            self.remote_call("configurationDone", None).await?;
        }

        // 6. Only now does the attach response arrive.
        attach.finish().await?;
        Ok(())
    }
}

impl std::fmt::Debug for DapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapClient")
            .field("adapter_id", &self.adapter_id)
            .field("next_seq", &self.next_seq)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

impl PendingCall {
    /// Await the response and unwrap it.
    pub async fn finish(self) -> Result<Option<serde_json::Value>, DapError> {
        let response = self.rx.await.map_err(|_| DapError::ConnectionClosed)?;
        debug_assert_eq!(response.request_seq, self.seq);
        if response.command != self.command {
            return Err(DapError::Protocol(format!(
                "response command {:?} does not match request command {:?}",
                response.command, self.command
            )));
        }
        if response.success {
            Ok(response.body)
        } else {
            Err(rejection_error(response))
        }
    }
}

impl EventWaiter {
    /// Resolve with the body of the first matching event, or
    /// [`DapError::ConnectionClosed`] if the connection goes away first.
    pub async fn wait(self) -> Result<Option<serde_json::Value>, DapError> {
        self.rx.await.map_err(|_| DapError::ConnectionClosed)
    }
}

/// Build the error for a `success: false` response: the adapter's message,
/// with every field beyond the standard envelope appended as detail.
fn rejection_error(response: Response) -> DapError {
    let mut detail = response.extra;
    if let Some(body) = response.body {
        detail.insert("body".to_string(), body);
    }
    let mut message = response.message.unwrap_or_default();
    if !detail.is_empty() {
        message.push_str(&serde_json::Value::Object(detail).to_string());
    }
    DapError::Rejected { message }
}
