// The pluggable operation handler boundary. The engine owns the wire; a
// handler owns the directory semantics behind it.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::proto::{
    self, AddRequest, BindRequest, CompareRequest, Control, DelRequest, LdapResult, ModifyDnRequest,
    ModifyRequest, ResultCode, SearchEntry, SearchRequest,
};
use crate::writer::MessageWriter;

/// Snapshot of the connection's authentication state, taken when the request
/// is dispatched. `bind_dn` is None until the first successful Bind; an
/// anonymous bind yields Some("").
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: String,
    pub bind_dn: Option<String>,
    pub version: i32,
}

/// Successful Bind outcome: the DN and protocol version the connection
/// operates under from now on.
#[derive(Debug, Clone)]
pub struct BindOutcome {
    pub dn: String,
    pub version: i32,
}

#[derive(Debug, Error)]
pub enum OpError {
    /// The request was abandoned; the worker must return without emitting
    /// any further PDU.
    #[error("operation abandoned")]
    Abandoned,
    /// The handler decided the operation fails with a specific result code.
    #[error("{message}")]
    Failed { code: ResultCode, message: String },
    /// Anything else the handler ran into; rendered as operationsError.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OpError {
    pub fn failed(code: ResultCode, message: impl Into<String>) -> Self {
        OpError::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn unwilling(message: impl Into<String>) -> Self {
        Self::failed(ResultCode::UnwillingToPerform, message)
    }

    /// The terminal LDAPResult this error renders as.
    pub fn to_result(&self) -> LdapResult {
        match self {
            OpError::Failed { code, message } => LdapResult::new(*code, message.clone()),
            OpError::Abandoned => {
                LdapResult::new(ResultCode::OperationsError, "operation abandoned")
            }
            OpError::Other(err) => LdapResult::new(ResultCode::OperationsError, err.to_string()),
        }
    }
}

/// Emits SearchResultEntry PDUs for one search. Each entry goes out as its
/// own PDU through the connection's write mutex; cancellation is checked
/// before every emission so an abandoned search stops mid-stream.
pub struct SearchChannel<'a> {
    writer: &'a MessageWriter,
    message_id: i32,
    token: &'a CancellationToken,
}

impl<'a> SearchChannel<'a> {
    pub(crate) fn new(
        writer: &'a MessageWriter,
        message_id: i32,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            writer,
            message_id,
            token,
        }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// True once the request was abandoned (Abandon, Bind, or Unbind).
    pub fn is_abandoned(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn entry(&self, entry: &SearchEntry) -> Result<(), OpError> {
        if self.token.is_cancelled() {
            return Err(OpError::Abandoned);
        }
        self.writer
            .write_frame(&proto::search_entry_pdu(self.message_id, entry))
            .await
            .map_err(|e| OpError::Other(e.into()))
    }
}

/// Directory semantics behind the protocol engine. One instance serves every
/// connection, so implementations must tolerate concurrent invocation.
///
/// The write operations default to unwillingToPerform for read-only
/// backends.
#[async_trait]
pub trait LdapOperations: Send + Sync + 'static {
    async fn bind(
        &self,
        session: &SessionInfo,
        request: &BindRequest,
        controls: &[Control],
    ) -> Result<BindOutcome, OpError>;

    async fn search(
        &self,
        session: &SessionInfo,
        request: &SearchRequest,
        controls: &[Control],
        chan: &SearchChannel<'_>,
    ) -> Result<LdapResult, OpError>;

    async fn modify(
        &self,
        session: &SessionInfo,
        request: &ModifyRequest,
        controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        let _ = (session, request, controls);
        Err(OpError::unwilling("modify not supported"))
    }

    async fn add(
        &self,
        session: &SessionInfo,
        request: &AddRequest,
        controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        let _ = (session, request, controls);
        Err(OpError::unwilling("add not supported"))
    }

    async fn delete(
        &self,
        session: &SessionInfo,
        request: &DelRequest,
        controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        let _ = (session, request, controls);
        Err(OpError::unwilling("delete not supported"))
    }

    async fn modify_dn(
        &self,
        session: &SessionInfo,
        request: &ModifyDnRequest,
        controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        let _ = (session, request, controls);
        Err(OpError::unwilling("modify DN not supported"))
    }

    async fn compare(
        &self,
        session: &SessionInfo,
        request: &CompareRequest,
        controls: &[Control],
    ) -> Result<LdapResult, OpError> {
        let _ = (session, request, controls);
        Err(OpError::unwilling("compare not supported"))
    }
}
