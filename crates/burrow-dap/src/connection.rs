//! Connection over a duplex byte stream.
//!
//! Owns the reader and writer halves, a [`Dispatcher`], and two background
//! tasks: a writer task draining an mpsc channel (so concurrent senders
//! cannot interleave frames) and a receive loop decoding one message at a
//! time and routing it by kind. When the stream closes or a frame fails to
//! decode, the loop closes the dispatcher so every in-flight caller
//! observes [`DapError::ConnectionClosed`] instead of hanging.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::{Dispatcher, EventCallback, ListenerId};
use crate::error::DapError;
use crate::protocol::{Message, Request, Response};
use crate::transport;

/// Handler for inbound requests when this side acts as a protocol server.
/// The handler fulfills the sender with the response to put on the wire.
pub type RequestHandler = Arc<dyn Fn(Request, oneshot::Sender<Response>) + Send + Sync>;

/// A live DAP connection.
///
/// [`close`](Self::close) tears the connection down locally; dropping the
/// connection does the same, so a discarded session does not leave its
/// socket and background tasks running until the remote hangs up.
pub struct Connection {
    dispatcher: Arc<Mutex<Dispatcher>>,
    /// Taken on close so the writer task can drain and exit.
    writer_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    request_handler: Arc<Mutex<Option<RequestHandler>>>,
    /// Taken and fired on close to unblock the receive loop.
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Lock a dispatcher, recovering from a poisoned lock. The dispatcher is
/// never held across an await, so a panic while holding it leaves only
/// per-entry state to clean up, which `close` does anyway.
fn lock(dispatcher: &Mutex<Dispatcher>) -> MutexGuard<'_, Dispatcher> {
    dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Build a connection from the two halves of a duplex stream and start
    /// its background tasks.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = Arc::new(Mutex::new(Dispatcher::new()));
        let request_handler: Arc<Mutex<Option<RequestHandler>>> = Arc::new(Mutex::new(None));

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(framed) = writer_rx.recv().await {
                if writer.write_all(&framed).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(receive_loop(
            BufReader::new(reader),
            dispatcher.clone(),
            writer_tx.clone(),
            request_handler.clone(),
            shutdown_rx,
        ));

        Self {
            dispatcher,
            writer_tx: Mutex::new(Some(writer_tx)),
            request_handler,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        }
    }

    /// Connect to a debug adapter over TCP.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, DapError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }

    /// Register the request with the dispatcher, write it to the wire, and
    /// return the slot its response will resolve. Does not wait for the
    /// response.
    pub async fn send_request(
        &self,
        request: Request,
    ) -> Result<oneshot::Receiver<Response>, DapError> {
        let framed = transport::encode_message(&Message::Request(request.clone()))?;
        let writer_tx = self
            .writer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DapError::ConnectionClosed)?;
        let rx = lock(&self.dispatcher).register_request(&request)?;
        writer_tx
            .send(framed)
            .await
            .map_err(|_| DapError::ConnectionClosed)?;
        Ok(rx)
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, request: Request) -> Result<Response, DapError> {
        let rx = self.send_request(request).await?;
        rx.await.map_err(|_| DapError::ConnectionClosed)
    }

    /// Register a persistent listener for the named event.
    pub fn add_event_listener(&self, event: &str, callback: EventCallback) -> ListenerId {
        lock(&self.dispatcher).subscribe(event, callback)
    }

    /// Remove a previously registered listener.
    pub fn remove_event_listener(&self, event: &str, id: ListenerId) -> bool {
        lock(&self.dispatcher).unsubscribe(event, id)
    }

    /// Register a one-shot waiter for the named event. The subscription
    /// exists as soon as this returns, so an event arriving before the
    /// receiver is awaited is not lost.
    pub fn subscribe_once(&self, event: &str) -> oneshot::Receiver<Option<serde_json::Value>> {
        lock(&self.dispatcher).subscribe_once(event)
    }

    /// Install the handler for inbound requests (server role). Without a
    /// handler, inbound requests are logged and left unanswered.
    pub fn set_request_handler(&self, handler: RequestHandler) {
        *self
            .request_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Shut the connection down from this side.
    ///
    /// Stops the receive loop, lets the writer task drain and exit, and
    /// fails every pending call and event waiter with
    /// [`DapError::ConnectionClosed`]. Idempotent; also runs on drop.
    pub fn close(&self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        drop(
            self.writer_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        lock(&self.dispatcher).close();
    }

    /// Whether the connection has been torn down, locally or by the remote.
    pub fn is_closed(&self) -> bool {
        lock(&self.dispatcher).is_closed()
    }

    /// Snapshot of recently seen messages, oldest first.
    pub fn recent_messages(&self) -> Vec<Message> {
        lock(&self.dispatcher).recent_messages().cloned().collect()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pending", &lock(&self.dispatcher).pending_count())
            .field("closed", &lock(&self.dispatcher).is_closed())
            .finish()
    }
}

async fn receive_loop<R>(
    mut reader: BufReader<R>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    request_handler: Arc<Mutex<Option<RequestHandler>>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let read = tokio::select! {
            _ = &mut shutdown_rx => break,
            read = transport::read_message(&mut reader) => read,
        };
        let message = match read {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!("adapter closed the connection");
                break;
            }
            Err(err) => {
                tracing::warn!("connection lost: {err}");
                break;
            }
        };

        match message {
            Message::Response(response) => {
                // A response nobody asked for is a protocol violation, but
                // not one worth dropping the whole session over.
                if let Err(err) = lock(&dispatcher).resolve_response(response) {
                    tracing::warn!("{err}");
                }
            }
            Message::Event(event) => {
                let callbacks = lock(&dispatcher).dispatch_event(&event);
                if callbacks.is_empty() {
                    tracing::debug!(event = %event.event, "no listeners for event");
                }
                // Invoked without the dispatcher lock held; listeners run
                // synchronously and in registration order, so a slow
                // listener delays subsequent inbound messages.
                for callback in callbacks {
                    callback(event.body.clone());
                }
            }
            Message::Request(request) => {
                handle_inbound_request(&dispatcher, &writer_tx, &request_handler, request);
            }
        }
    }

    lock(&dispatcher).close();
}

fn handle_inbound_request(
    dispatcher: &Arc<Mutex<Dispatcher>>,
    writer_tx: &mpsc::Sender<Vec<u8>>,
    request_handler: &Arc<Mutex<Option<RequestHandler>>>,
    request: Request,
) {
    let (reply_tx, reply_rx) = match lock(dispatcher).accept_request(&request) {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!("{err}");
            return;
        }
    };

    let seq = request.seq;
    let handler = request_handler
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match handler {
        Some(handler) => handler(request, reply_tx),
        None => {
            tracing::debug!(command = %request.command, "no handler for inbound request");
            drop(reply_tx);
        }
    }

    // Write the reply once the handler fulfills its slot. A dropped slot
    // means the request goes unanswered.
    let dispatcher = dispatcher.clone();
    let writer_tx = writer_tx.clone();
    tokio::spawn(async move {
        let outcome = reply_rx.await;
        lock(&dispatcher).finish_inbound(seq);
        if let Ok(response) = outcome {
            match transport::encode_message(&Message::Response(response)) {
                Ok(framed) => {
                    let _ = writer_tx.send(framed).await;
                }
                Err(err) => tracing::warn!("failed to encode response: {err}"),
            }
        }
    });
}
