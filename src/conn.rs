// Per-connection protocol engine: reads one PDU at a time, runs Bind and
// Abandon synchronously, fans everything else out to worker tasks, and
// enforces the cancellation barriers of RFC 4511.

use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::ber::{self, FrameError};
use crate::handler::{LdapOperations, OpError, SearchChannel, SessionInfo};
use crate::proto::{self, Control, Envelope, LdapResult, Request, ResultCode, TAG_BIND_RESPONSE};
use crate::requests::ActiveRequests;
use crate::writer::MessageWriter;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

enum Flow {
    Continue,
    Close,
}

/// One accepted connection: dispatch loop state plus the shared write side.
pub struct Connection<H> {
    peer: String,
    handler: Arc<H>,
    writer: MessageWriter,
    requests: Arc<ActiveRequests>,
    bind_dn: Option<String>,
    version: i32,
    max_message_bytes: usize,
}

impl<H: LdapOperations> Connection<H> {
    pub fn new(writer: MessageWriter, handler: Arc<H>, peer: String, max_message_bytes: usize) -> Self {
        Self {
            peer,
            handler,
            writer,
            requests: Arc::new(ActiveRequests::new()),
            bind_dn: None,
            version: 3,
            max_message_bytes,
        }
    }

    /// Run the dispatch loop until the peer unbinds, closes, or violates the
    /// protocol. On a protocol error a Notice of Disconnection is sent
    /// best-effort before closing. All in-flight workers are cancelled on
    /// every exit path.
    pub async fn run<R: AsyncRead + Unpin>(mut self, mut reader: R) -> Result<(), EngineError> {
        let mut buf = BytesMut::with_capacity(4096);
        let result = self.dispatch_loop(&mut reader, &mut buf).await;
        if let Err(EngineError::Protocol(reason)) = &result {
            warn!("[{}]: protocol error: {}", self.peer, reason);
            let notice = proto::notice_of_disconnection(ResultCode::ProtocolError, reason);
            let _ = self.writer.write_frame(&notice).await;
        }
        self.requests.cancel_all();
        result
    }

    async fn dispatch_loop<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        buf: &mut BytesMut,
    ) -> Result<(), EngineError> {
        loop {
            let frame = match ber::read_element(reader, buf, self.max_message_bytes).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("[{}]: connection closed by peer", self.peer);
                    return Ok(());
                }
                Err(FrameError::Io(e)) => return Err(EngineError::Transport(e)),
                Err(e) => return Err(EngineError::Protocol(e.to_string())),
            };
            let envelope =
                Envelope::decode(&frame).map_err(|e| EngineError::Protocol(e.to_string()))?;
            match self.dispatch(envelope).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<Flow, EngineError> {
        let Envelope {
            message_id,
            request,
            controls,
        } = envelope;
        match request {
            Request::Bind(bind) => {
                self.handle_bind(message_id, bind, controls).await?;
                Ok(Flow::Continue)
            }
            Request::Unbind => {
                debug!("[{}]: unbind", self.peer);
                self.requests.cancel_all();
                Ok(Flow::Close)
            }
            Request::Abandon(target) => {
                if self.requests.cancel(target) {
                    debug!("[{}]: abandoned msgid {}", self.peer, target);
                } else {
                    debug!("[{}]: abandon for unknown msgid {} ignored", self.peer, target);
                }
                Ok(Flow::Continue)
            }
            request => {
                self.spawn_worker(message_id, request, controls);
                Ok(Flow::Continue)
            }
        }
    }

    /// Bind is totally ordered: every outstanding worker is cancelled before
    /// the handler runs, and the next PDU is not read until the response is
    /// on the wire. A failed bind leaves the previous state in place.
    async fn handle_bind(
        &mut self,
        message_id: i32,
        bind: proto::BindRequest,
        controls: Vec<Control>,
    ) -> Result<(), EngineError> {
        self.requests.cancel_all();
        let session = self.session();
        let result = match self.handler.bind(&session, &bind, &controls).await {
            Ok(outcome) => {
                info!(
                    "[{}]: bound as \"{}\" (version {})",
                    self.peer, outcome.dn, outcome.version
                );
                self.bind_dn = Some(outcome.dn);
                self.version = outcome.version;
                LdapResult::success()
            }
            Err(err) => {
                info!("[{}]: bind as \"{}\" failed: {}", self.peer, bind.name, err);
                err.to_result()
            }
        };
        let frame = proto::terminal_response(TAG_BIND_RESPONSE, message_id, &result);
        self.writer.write_frame(&frame).await?;
        Ok(())
    }

    fn spawn_worker(&self, message_id: i32, request: Request, controls: Vec<Control>) {
        let response_tag = match request.response_tag() {
            Some(tag) => tag,
            None => return,
        };
        let token = self.requests.insert(message_id);
        let handler = Arc::clone(&self.handler);
        let writer = self.writer.clone();
        let requests = Arc::clone(&self.requests);
        let session = self.session();
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let op = request.name();
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(OpError::Abandoned),
                outcome = invoke(
                    handler.as_ref(),
                    &session,
                    &request,
                    &controls,
                    &writer,
                    message_id,
                    &token,
                ) => outcome,
            };
            requests.remove(message_id);
            let result = match outcome {
                Ok(result) => result,
                Err(OpError::Abandoned) => {
                    debug!("[{}]: {} (msgid {}) abandoned", peer, op, message_id);
                    return;
                }
                Err(err) => {
                    warn!("[{}]: {} (msgid {}) failed: {}", peer, op, message_id, err);
                    err.to_result()
                }
            };
            if token.is_cancelled() {
                debug!("[{}]: {} (msgid {}) cancelled before response", peer, op, message_id);
                return;
            }
            let frame = proto::terminal_response(response_tag, message_id, &result);
            if let Err(e) = writer.write_frame(&frame).await {
                debug!("[{}]: write failed: {}", peer, e);
            }
        });
    }

    fn session(&self) -> SessionInfo {
        SessionInfo {
            peer: self.peer.clone(),
            bind_dn: self.bind_dn.clone(),
            version: self.version,
        }
    }
}

async fn invoke<H: LdapOperations>(
    handler: &H,
    session: &SessionInfo,
    request: &Request,
    controls: &[Control],
    writer: &MessageWriter,
    message_id: i32,
    token: &CancellationToken,
) -> Result<LdapResult, OpError> {
    match request {
        Request::Search(req) => {
            let chan = SearchChannel::new(writer, message_id, token);
            handler.search(session, req, controls, &chan).await
        }
        Request::Modify(req) => handler.modify(session, req, controls).await,
        Request::Add(req) => handler.add(session, req, controls).await,
        Request::Del(req) => handler.delete(session, req, controls).await,
        Request::ModifyDn(req) => handler.modify_dn(session, req, controls).await,
        Request::Compare(req) => handler.compare(session, req, controls).await,
        Request::Bind(_) | Request::Unbind | Request::Abandon(_) => {
            unreachable!("dispatched synchronously")
        }
    }
}
