//! The service engine (spec §4.5, component C5): connection lifecycle,
//! protocol state machine, send/receive queues, flow control, and
//! upcall dispatch.
//!
//! Three cooperating tasks share one connection (spec §5, "reader,
//! sender, writer"): a reader task decodes inbound PDUs and drives the
//! handshake, reassembly and dispatch; a sender task drains the
//! outgoing DIMSE message queue, turning each message into PDVs/PDUs
//! through a [`PdvStream`]; a writer task drains the outgoing PDU queue
//! onto the wire. [`ServiceHandle`] is the thread-safe front the three
//! tasks (and the host, for outgoing requests) share; it owns no I/O
//! itself, only the shared `Inner` state behind a `tokio::sync::Mutex`
//! plus a `Notify` used to wake waiters cheaply instead of polling
//! tightly (though a short poll interval is still used for the
//! flow-control backoffs named in spec §4.5/§5, matching the original's
//! `Task.Delay`-based loops).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace, warn, Instrument};

use crate::assoc::{Association, PresentationContext};
use crate::dimse::{self, CommandField, DicomMessage, Status};
use crate::error::{
    DimseSnafu, EncodeDatasetSnafu, Error, ReassembleSnafu, Result, TranscodeSnafu,
};
use crate::options::{AbstractSyntaxPolicy, AccessControl, ServiceOptions};
use crate::pdata::{PduSink, PdvStream};
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceProviderAcseReason, AssociationRJSource, AssociationRQ, Pdu,
    PresentationContextProposed, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE,
};
use crate::reassemble::{ReassembleOutcome, Reassembler};
use crate::roles::{NServiceOutcome, ServiceHandlers, StreamingResponseItem};
use crate::sink::CStoreSinkProvider;
use crate::transcode::DatasetTranscoder;
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// The client-side handshake parameters a host supplies to
/// [`ServiceEngine::new_client`] (spec §4.2, "requestor role").
#[derive(Debug, Clone)]
pub struct AssociationRequest {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_identity: Option<UserIdentity>,
    /// SCP/SCU Role Selection items to propose, as (SOP class UID, SCU
    /// role supported, SCP role supported) (PS3.7 Annex D.3.3.4).
    pub role_selections: Vec<(String, bool, bool)>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    /// The handshake has not completed (or this is a client that has
    /// not yet sent its request).
    Idle,
    Associated,
    Closed,
}

struct PendingRequest {
    responder: mpsc::UnboundedSender<DicomMessage>,
}

enum Outgoing {
    Request {
        message: DicomMessage,
        responder: mpsc::UnboundedSender<DicomMessage>,
    },
    Response(DicomMessage),
}

struct Inner {
    state: State,
    association: Option<Association>,
    pdu_queue: VecDeque<Pdu>,
    msg_queue: VecDeque<Outgoing>,
    pending: HashMap<u16, PendingRequest>,
    close_after_flush: bool,
    closed_notified: bool,
    next_message_id: u16,
}

/// The thread-safe handle shared by the reader, sender and writer
/// tasks of one association, and returned to the host for sending
/// requests/responses (spec §4.5).
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    options: Arc<ServiceOptions<'static>>,
}

impl ServiceHandle {
    fn new(options: Arc<ServiceOptions<'static>>) -> Self {
        ServiceHandle {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Idle,
                association: None,
                pdu_queue: VecDeque::new(),
                msg_queue: VecDeque::new(),
                pending: HashMap::new(),
                close_after_flush: false,
                closed_notified: false,
                next_message_id: 1,
            })),
            notify: Arc::new(Notify::new()),
            options,
        }
    }

    /// The negotiated association, once the handshake has completed.
    pub async fn association(&self) -> Option<Association> {
        self.inner.lock().await.association.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == State::Closed
    }

    /// Enqueue `pdu` for transmission, applying `MaximumPDUsInQueue`
    /// backpressure (spec §3, §4.5, §8 E6).
    pub(crate) async fn enqueue_pdu(&self, pdu: Pdu) -> Result<()> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.state == State::Closed {
                    return Err(Error::Closed);
                }
                if inner.pdu_queue.len() < self.options.maximum_pdus_in_queue {
                    inner.pdu_queue.push_back(pdu);
                    self.notify.notify_waiters();
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Send a new DIMSE request, assigning it the next message id and
    /// returning the channel its response(s) will arrive on (more than
    /// one, for C-FIND/C-MOVE/C-GET's `Pending` stream).
    pub async fn send_request(
        &self,
        mut message: DicomMessage,
    ) -> Result<mpsc::UnboundedReceiver<DicomMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let message_id = {
            let mut inner = self.inner.lock().await;
            if inner.state != State::Associated {
                return Err(Error::Closed);
            }
            let id = inner.next_message_id;
            inner.next_message_id = if id == u16::MAX { 1 } else { id + 1 };
            id
        };
        message
            .command
            .put(dimse::element_u16_value(tags::MESSAGE_ID, message_id));

        let mut inner = self.inner.lock().await;
        inner.msg_queue.push_back(Outgoing::Request {
            message,
            responder: tx,
        });
        drop(inner);
        self.notify.notify_waiters();
        Ok(rx)
    }

    /// Send a response to a previously-dispatched request (the usual
    /// way a [`ServiceHandlers`] implementation replies; the engine's
    /// own request dispatch also goes through this).
    pub async fn send_response(&self, message: DicomMessage) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == State::Closed {
            return Err(Error::Closed);
        }
        inner.msg_queue.push_back(Outgoing::Response(message));
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Ask the peer to release the association in an orderly fashion
    /// (client role).
    pub async fn request_release(&self) -> Result<()> {
        self.enqueue_pdu(Pdu::ReleaseRQ).await
    }

    /// Abort the association immediately.
    pub async fn abort(&self, source: AbortRQSource) -> Result<()> {
        self.enqueue_pdu(Pdu::AbortRQ { source }).await?;
        self.mark_close_after_flush().await;
        Ok(())
    }

    async fn mark_close_after_flush(&self) {
        let mut inner = self.inner.lock().await;
        inner.close_after_flush = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Transition to `Closed` and, the first time this is called for
    /// this connection, run the `on_connection_closed` upcall (spec §5,
    /// §8 invariant 7).
    async fn close_connection<H: ServiceHandlers>(&self, err: Option<Error>, handlers: &H) {
        let should_notify = {
            let mut inner = self.inner.lock().await;
            inner.state = State::Closed;
            let first = !inner.closed_notified;
            inner.closed_notified = true;
            inner.pending.clear();
            first
        };
        self.notify.notify_waiters();
        if should_notify {
            handlers.on_connection_closed(err.as_ref()).await;
        }
    }
}

impl PduSink for ServiceHandle {
    type Error = Error;

    fn send_pdu(&mut self, pdu: Pdu) -> impl Future<Output = Result<()>> + Send {
        let handle = self.clone();
        async move { handle.enqueue_pdu(pdu).await }
    }
}

#[derive(Clone)]
enum ReaderRole {
    Server,
    Client(AssociationRequest),
}

enum RoleConfig {
    Server,
    Client(AssociationRequest),
}

/// The DICOM upper layer service engine. Owns the byte stream for the
/// lifetime of one association; [`Self::run`] drives it to completion
/// and returns once the connection has closed.
pub struct ServiceEngine<S, H, P> {
    stream: S,
    handle: ServiceHandle,
    handlers: Arc<H>,
    sink_provider: P,
    transcoder: Arc<dyn DatasetTranscoder>,
    access_control: Option<Arc<dyn AccessControl>>,
    abstract_syntax_policy: Option<Arc<dyn AbstractSyntaxPolicy>>,
    role: RoleConfig,
    log_id: String,
}

impl<S, H, P> ServiceEngine<S, H, P>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: ServiceHandlers + 'static,
    P: CStoreSinkProvider + 'static,
{
    /// Start building a server-role (SCP) engine over an accepted
    /// connection.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        stream: S,
        options: ServiceOptions<'static>,
        access_control: Arc<dyn AccessControl>,
        abstract_syntax_policy: Arc<dyn AbstractSyntaxPolicy>,
        transcoder: Arc<dyn DatasetTranscoder>,
        sink_provider: P,
        handlers: H,
    ) -> (Self, ServiceHandle) {
        let options = Arc::new(options);
        let handle = ServiceHandle::new(options.clone());
        let log_id = options.ae_title.to_string();
        let engine = ServiceEngine {
            stream,
            handle: handle.clone(),
            handlers: Arc::new(handlers),
            sink_provider,
            transcoder,
            access_control: Some(access_control),
            abstract_syntax_policy: Some(abstract_syntax_policy),
            role: RoleConfig::Server,
            log_id,
        };
        (engine, handle)
    }

    /// Start building a client-role (SCU) engine over a connection this
    /// node initiated. The handshake (`A-ASSOCIATE-RQ`) is sent as soon
    /// as [`Self::run`] starts.
    pub fn new_client(
        stream: S,
        options: ServiceOptions<'static>,
        request: AssociationRequest,
        transcoder: Arc<dyn DatasetTranscoder>,
        sink_provider: P,
        handlers: H,
    ) -> (Self, ServiceHandle) {
        let options = Arc::new(options);
        let handle = ServiceHandle::new(options.clone());
        let log_id = options.ae_title.to_string();
        let engine = ServiceEngine {
            stream,
            handle: handle.clone(),
            handlers: Arc::new(handlers),
            sink_provider,
            transcoder,
            access_control: None,
            abstract_syntax_policy: None,
            role: RoleConfig::Client(request),
            log_id,
        };
        (engine, handle)
    }

    /// Drive the connection: perform (or wait for) the handshake, then
    /// service PDUs and DIMSE messages until the association closes.
    /// Returns the reason the connection ended, if it was an error.
    pub async fn run(self) -> Result<()> {
        let ServiceEngine {
            stream,
            handle,
            handlers,
            sink_provider,
            transcoder,
            access_control,
            abstract_syntax_policy,
            role,
            log_id,
        } = self;

        let span = tracing::debug_span!("association", log_id = %log_id);
        async move {
            if let RoleConfig::Client(request) = &role {
                let rq = build_association_rq(&handle.options, request);
                handle.enqueue_pdu(Pdu::AssociationRQ(rq)).await?;
                {
                    let mut inner = handle.inner.lock().await;
                    inner.state = State::Idle;
                }
            }

            let (read_half, write_half) = tokio::io::split(stream);

            let reader_role = match &role {
                RoleConfig::Server => ReaderRole::Server,
                RoleConfig::Client(request) => ReaderRole::Client(request.clone()),
            };

            let reader_task = tokio::spawn(
                run_reader(
                    read_half,
                    handle.clone(),
                    handlers.clone(),
                    sink_provider,
                    access_control,
                    abstract_syntax_policy,
                    reader_role,
                )
                .in_current_span(),
            );
            let sender_task =
                tokio::spawn(run_sender(handle.clone(), transcoder).in_current_span());
            let writer_task = tokio::spawn(
                run_writer(write_half, handle.clone(), handlers.clone()).in_current_span(),
            );

            let (r1, r2, r3) = tokio::join!(reader_task, sender_task, writer_task);
            let r1 = r1.unwrap_or(Ok(()));
            let r2 = r2.unwrap_or(Ok(()));
            let r3 = r3.unwrap_or(Ok(()));
            r1.and(r2).and(r3)
        }
        .instrument(span)
        .await
    }
}

fn build_association_rq(options: &ServiceOptions<'static>, request: &AssociationRequest) -> AssociationRQ {
    let mut user_variables = vec![
        UserVariableItem::MaxLength(options.max_pdu_length),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ];
    if options.max_async_ops_invoked != 1 {
        user_variables.push(UserVariableItem::AsyncOperationsWindow {
            max_ops_invoked: options.max_async_ops_invoked,
            max_ops_performed: 1,
        });
    }
    if let Some(identity) = &request.user_identity {
        user_variables.push(UserVariableItem::UserIdentity(identity.clone()));
    }
    for (sop_class_uid, scu_role_supported, scp_role_supported) in &request.role_selections {
        user_variables.push(UserVariableItem::RoleSelection {
            sop_class_uid: sop_class_uid.clone(),
            scu_role_supported: *scu_role_supported,
            scp_role_supported: *scp_role_supported,
        });
    }

    AssociationRQ {
        protocol_version: 1,
        calling_ae_title: request.calling_ae_title.clone(),
        called_ae_title: request.called_ae_title.clone(),
        application_context_name: options.application_context_name.to_string(),
        presentation_contexts: request.presentation_contexts.clone(),
        user_variables,
    }
}

fn find_user_variable<'a, T>(
    variables: &'a [UserVariableItem],
    extract: impl Fn(&'a UserVariableItem) -> Option<T>,
) -> Option<T> {
    variables.iter().find_map(extract)
}

async fn handle_association_rq<H: ServiceHandlers>(
    rq: AssociationRQ,
    handle: &ServiceHandle,
    handlers: &Arc<H>,
    association: &mut Option<Association>,
    access_control: &dyn AccessControl,
    abstract_syntax_policy: &dyn AbstractSyntaxPolicy,
) -> Result<()> {
    if rq.protocol_version != 1 {
        return reject(
            handle,
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            ),
        )
        .await;
    }

    if rq.application_context_name.trim_end_matches(['\0', ' '])
        != handle.options.application_context_name
    {
        return reject(
            handle,
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(
                crate::pdu::AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        )
        .await;
    }

    let user_identity = find_user_variable(&rq.user_variables, |v| match v {
        UserVariableItem::UserIdentity(id) => Some(id),
        _ => None,
    });

    if let Err(reason) = access_control.check_access(
        &handle.options.ae_title,
        &rq.calling_ae_title,
        &rq.called_ae_title,
        user_identity,
    ) {
        return reject(
            handle,
            AssociationRJResult::Permanent,
            AssociationRJSource::ServiceUser(reason),
        )
        .await;
    }

    let requestor_max_pdu = find_user_variable(&rq.user_variables, |v| match v {
        UserVariableItem::MaxLength(n) => Some(*n),
        _ => None,
    })
    .unwrap_or(DEFAULT_MAX_PDU);

    let mut new_association =
        Association::new(rq.calling_ae_title.clone(), rq.called_ae_title.clone(), requestor_max_pdu);
    new_association.remote_implementation_class_uid =
        find_user_variable(&rq.user_variables, |v| match v {
            UserVariableItem::ImplementationClassUID(u) => Some(u.clone()),
            _ => None,
        });
    new_association.remote_implementation_version_name =
        find_user_variable(&rq.user_variables, |v| match v {
            UserVariableItem::ImplementationVersionName(u) => Some(u.clone()),
            _ => None,
        });
    let remote_max_async_ops = find_user_variable(&rq.user_variables, |v| match v {
        UserVariableItem::AsyncOperationsWindow { max_ops_invoked, .. } => Some(*max_ops_invoked),
        _ => None,
    });
    new_association.max_async_ops_invoked = match (handle.options.max_async_ops_invoked, remote_max_async_ops) {
        (0, _) => 0,
        (mine, Some(theirs)) if theirs != 0 => mine.min(theirs),
        (mine, _) => mine,
    };

    let role_selections: Vec<(String, bool, bool)> = rq
        .user_variables
        .iter()
        .filter_map(|v| match v {
            UserVariableItem::RoleSelection {
                sop_class_uid,
                scu_role_supported,
                scp_role_supported,
            } => Some((sop_class_uid.clone(), *scu_role_supported, *scp_role_supported)),
            _ => None,
        })
        .collect();

    let accepted = new_association.accept_presentation_contexts(
        &rq.presentation_contexts,
        abstract_syntax_policy,
        &role_selections,
    );

    let mut ac_user_variables = vec![
        UserVariableItem::MaxLength(handle.options.max_pdu_length),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ];
    // PS3.7 Annex D.3.3.4: role selection is echoed back unchanged, not
    // renegotiated; the acceptor either supports the proposed roles or
    // rejects the association context some other way.
    for (sop_class_uid, scu_role_supported, scp_role_supported) in &role_selections {
        ac_user_variables.push(UserVariableItem::RoleSelection {
            sop_class_uid: sop_class_uid.clone(),
            scu_role_supported: *scu_role_supported,
            scp_role_supported: *scp_role_supported,
        });
    }

    let ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: rq.calling_ae_title,
        called_ae_title: rq.called_ae_title,
        application_context_name: handle.options.application_context_name.to_string(),
        presentation_contexts: accepted,
        user_variables: ac_user_variables,
    };

    if handle.options.use_remote_ae_for_log_name {
        tracing::Span::current().record("log_id", tracing::field::display(&new_association.calling_ae_title));
    }

    {
        let mut inner = handle.inner.lock().await;
        inner.state = State::Associated;
    }
    *association = Some(new_association.clone());

    handle.enqueue_pdu(Pdu::AssociationAC(ac)).await?;
    handlers.on_receive_association_request(&new_association).await;
    Ok(())
}

async fn handle_association_ac<H: ServiceHandlers>(
    ac: AssociationAC,
    request: &AssociationRequest,
    handle: &ServiceHandle,
    handlers: &Arc<H>,
    association: &mut Option<Association>,
) -> Result<()> {
    let acceptor_max_pdu = find_user_variable(&ac.user_variables, |v| match v {
        UserVariableItem::MaxLength(n) => Some(*n),
        _ => None,
    })
    .unwrap_or(DEFAULT_MAX_PDU);

    let mut new_association = Association::new(
        request.calling_ae_title.clone(),
        request.called_ae_title.clone(),
        acceptor_max_pdu,
    );
    new_association.remote_implementation_class_uid =
        find_user_variable(&ac.user_variables, |v| match v {
            UserVariableItem::ImplementationClassUID(u) => Some(u.clone()),
            _ => None,
        });
    new_association.remote_implementation_version_name =
        find_user_variable(&ac.user_variables, |v| match v {
            UserVariableItem::ImplementationVersionName(u) => Some(u.clone()),
            _ => None,
        });
    new_association.max_async_ops_invoked = handle.options.max_async_ops_invoked;
    new_association.record_accepted_contexts(&request.presentation_contexts, &ac.presentation_contexts);

    if handle.options.use_remote_ae_for_log_name {
        tracing::Span::current().record("log_id", tracing::field::display(&request.called_ae_title));
    }

    {
        let mut inner = handle.inner.lock().await;
        inner.state = State::Associated;
    }
    *association = Some(new_association.clone());

    handlers.on_receive_association_accept(&new_association).await;
    Ok(())
}

async fn reject(handle: &ServiceHandle, result: AssociationRJResult, source: AssociationRJSource) -> Result<()> {
    handle
        .enqueue_pdu(Pdu::AssociationRJ(AssociationRJ { result, source }))
        .await?;
    handle.mark_close_after_flush().await;
    Ok(())
}

async fn run_reader<H, P, R>(
    mut read_half: R,
    handle: ServiceHandle,
    handlers: Arc<H>,
    sink_provider: P,
    access_control: Option<Arc<dyn AccessControl>>,
    abstract_syntax_policy: Option<Arc<dyn AbstractSyntaxPolicy>>,
    role: ReaderRole,
) -> Result<()>
where
    H: ServiceHandlers,
    P: CStoreSinkProvider,
    R: AsyncRead + Unpin + Send,
{
    let max_incoming_pdu = if handle.options.max_pdu_length == 0 {
        MAXIMUM_PDU_SIZE
    } else {
        handle.options.max_pdu_length
    };

    let mut buf = BytesMut::with_capacity(max_incoming_pdu as usize);
    let mut reassembler = Reassembler::new(sink_provider, handle.options.ae_title.to_string());
    let mut association: Option<Association> = None;

    'outer: loop {
        loop {
            if handle.is_closed().await {
                break 'outer;
            }

            match crate::pdu::read_pdu(&mut buf, max_incoming_pdu, handle.options.strict) {
                Ok(Some(pdu)) => {
                    if let Err(err) = handle_incoming_pdu(
                        pdu,
                        &handle,
                        &handlers,
                        &mut reassembler,
                        &mut association,
                        access_control.as_deref(),
                        abstract_syntax_policy.as_deref(),
                        &role,
                    )
                    .await
                    {
                        handle.close_connection(Some(err_ref_clone(&err)), &*handlers).await;
                        return Err(err);
                    }
                    if handle.is_closed().await {
                        break 'outer;
                    }
                    continue;
                }
                Ok(None) => break,
                Err(source) => {
                    warn!(error = %source, "malformed PDU, aborting association");
                    let _ = handle
                        .enqueue_pdu(Pdu::AbortRQ {
                            source: AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
                            ),
                        })
                        .await;
                    handle.mark_close_after_flush().await;
                    let err = Error::Protocol { source };
                    handle.close_connection(Some(err_ref_clone(&err)), &*handlers).await;
                    return Err(err);
                }
            }
        }

        tokio::select! {
            biased;
            _ = handle.notify.notified() => {
                if handle.is_closed().await {
                    break 'outer;
                }
            }
            result = read_half.read_buf(&mut buf) => {
                match result {
                    Ok(0) => {
                        handle.close_connection(None, &*handlers).await;
                        break 'outer;
                    }
                    Ok(_) => {}
                    Err(source) => {
                        let err = Error::Transport { source };
                        handle.close_connection(Some(err_ref_clone(&err)), &*handlers).await;
                        break 'outer;
                    }
                }
            }
        }
    }

    Ok(())
}

/// `Error` carries non-`Clone` sources; close_connection only needs the
/// error for one read-only upcall, so reduce it to a fresh value that
/// displays the same failure instead of requiring `Clone` everywhere.
fn err_ref_clone(err: &Error) -> Error {
    Error::Transport {
        source: std::io::Error::other(err.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_incoming_pdu<H, P>(
    pdu: Pdu,
    handle: &ServiceHandle,
    handlers: &Arc<H>,
    reassembler: &mut Reassembler<P>,
    association: &mut Option<Association>,
    access_control: Option<&dyn AccessControl>,
    abstract_syntax_policy: Option<&dyn AbstractSyntaxPolicy>,
    role: &ReaderRole,
) -> Result<()>
where
    H: ServiceHandlers,
    P: CStoreSinkProvider,
{
    match (pdu, role) {
        (Pdu::AssociationRQ(rq), ReaderRole::Server) => {
            handle_association_rq(
                rq,
                handle,
                handlers,
                association,
                access_control.expect("server role always carries access control"),
                abstract_syntax_policy.expect("server role always carries an abstract syntax policy"),
            )
            .await
        }
        (Pdu::AssociationAC(ac), ReaderRole::Client(request)) => {
            handle_association_ac(ac, request, handle, handlers, association).await
        }
        (Pdu::AssociationRJ(rj), ReaderRole::Client(_)) => {
            handlers.on_receive_association_reject(rj.result, rj.source).await;
            handle.close_connection(None, &**handlers).await;
            Ok(())
        }
        (Pdu::PData { data }, _) => {
            let Some(assoc) = association.as_ref() else {
                return Err(Error::Closed);
            };
            for pdv in data {
                if handle.options.log_data_pdus {
                    trace!(
                        presentation_context_id = pdv.presentation_context_id,
                        is_command = matches!(pdv.value_type, crate::pdu::PDataValueType::Command),
                        is_last = pdv.is_last,
                        bytes = pdv.data.len(),
                        "received P-DATA-TF PDV"
                    );
                }
                match reassembler.process_pdv(pdv, assoc).await {
                    Ok(ReassembleOutcome::Continue) => {}
                    Ok(ReassembleOutcome::Delivered(message)) => {
                        dispatch_message(handle, handlers, assoc, message).await?;
                    }
                    Ok(ReassembleOutcome::CStoreDecodeFailed(response, reason)) => {
                        handlers.on_c_store_request_exception(None, &reason).await;
                        handle.send_response(response).await?;
                    }
                    Err(source) => {
                        warn!(error = %source, "failed to reassemble incoming message, aborting");
                        let _ = handle
                            .enqueue_pdu(Pdu::AbortRQ {
                                source: AbortRQSource::ServiceProvider(
                                    AbortRQServiceProviderReason::InvalidPduParameter,
                                ),
                            })
                            .await;
                        handle.mark_close_after_flush().await;
                        return Err(source).context(ReassembleSnafu);
                    }
                }
            }
            Ok(())
        }
        (Pdu::ReleaseRQ, _) => {
            handlers.on_receive_association_release_request().await;
            handle.enqueue_pdu(Pdu::ReleaseRP).await?;
            handle.mark_close_after_flush().await;
            Ok(())
        }
        (Pdu::ReleaseRP, _) => {
            handlers.on_receive_association_release_response().await;
            handle.close_connection(None, &**handlers).await;
            Ok(())
        }
        (Pdu::AbortRQ { source }, _) => {
            handlers.on_receive_abort(source).await;
            handle.close_connection(None, &**handlers).await;
            Ok(())
        }
        (Pdu::Unknown { pdu_type: 0xFF, .. }, _) => {
            trace!("ignoring reserved no-op PDU type 0xFF");
            Ok(())
        }
        (Pdu::Unknown { pdu_type, .. }, _) => {
            warn!(pdu_type, "unrecognized PDU type, aborting");
            let _ = handle
                .enqueue_pdu(Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                })
                .await;
            handle.mark_close_after_flush().await;
            Err(Error::UnexpectedPdu { pdu_type })
        }
        (pdu, _) => {
            let pdu_type = pdu.pdu_type();
            warn!(pdu_type, "unexpected PDU for current association state, aborting");
            let _ = handle
                .enqueue_pdu(Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
                })
                .await;
            handle.mark_close_after_flush().await;
            Err(Error::UnexpectedPdu { pdu_type })
        }
    }
}

async fn dispatch_message<H: ServiceHandlers>(
    handle: &ServiceHandle,
    handlers: &Arc<H>,
    association: &Association,
    message: DicomMessage,
) -> Result<()> {
    if handle.options.log_dimse_datasets {
        trace!(
            command_field = ?message.command_field,
            presentation_context_id = message.presentation_context_id,
            dataset = ?message.dataset,
            "received DIMSE message"
        );
    }

    if message.command_field.is_request() {
        dispatch_request(handle, handlers, association, message).await
    } else {
        route_response(handle, message).await;
        Ok(())
    }
}

async fn route_response(handle: &ServiceHandle, message: DicomMessage) {
    let Some(request_message_id) = message.request_message_id() else {
        warn!("response message missing MessageIDBeingRespondedTo, dropping");
        return;
    };
    let status = message.status();
    let terminal = status.map(|s| !s.state.is_pending()).unwrap_or(true);

    let mut inner = handle.inner.lock().await;
    if terminal {
        if let Some(pending) = inner.pending.remove(&request_message_id) {
            let _ = pending.responder.send(message);
        } else {
            warn!(request_message_id, "response for unknown or already-completed request, dropping");
        }
    } else if let Some(pending) = inner.pending.get(&request_message_id) {
        let _ = pending.responder.send(message);
    } else {
        warn!(request_message_id, "pending response for unknown request, dropping");
    }
}

async fn unimplemented(handle: &ServiceHandle, command_field: CommandField) -> Result<()> {
    warn!(?command_field, "no provider registered for this DIMSE command, aborting");
    let _ = handle
        .enqueue_pdu(Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        })
        .await;
    handle.mark_close_after_flush().await;
    Err(Error::UnimplementedRole {
        command_field: command_field as u16,
    })
}

async fn dispatch_request<H: ServiceHandlers>(
    handle: &ServiceHandle,
    handlers: &Arc<H>,
    association: &Association,
    message: DicomMessage,
) -> Result<()> {
    match message.command_field {
        CommandField::CEchoRq => match handlers.on_c_echo_request(&message).await {
            Some(status) => {
                let response = dimse::build_response(&message, status, None).context(DimseSnafu)?;
                handle.send_response(response).await
            }
            None => unimplemented(handle, message.command_field).await,
        },
        CommandField::CStoreRq => match handlers.on_c_store_request(&message).await {
            Some(status) => {
                let mut response = dimse::build_response(&message, status, None).context(DimseSnafu)?;
                if let Some(uid) = dimse::element_str(&message.command, tags::AFFECTED_SOP_INSTANCE_UID) {
                    response.command.put(dimse::element_str_value(
                        tags::AFFECTED_SOP_INSTANCE_UID,
                        dicom_core::VR::UI,
                        &uid,
                    ));
                }
                handle.send_response(response).await
            }
            None => unimplemented(handle, message.command_field).await,
        },
        CommandField::CFindRq => {
            dispatch_streaming(handle, handlers.clone(), message, association, StreamKind::Find).await
        }
        CommandField::CMoveRq | CommandField::CGetRq => {
            dispatch_streaming(handle, handlers.clone(), message, association, StreamKind::MoveOrGet).await
        }
        CommandField::NEventReportRq => dispatch_n(handle, handlers, &message, NVerb::EventReport).await,
        CommandField::NGetRq => dispatch_n(handle, handlers, &message, NVerb::Get).await,
        CommandField::NSetRq => dispatch_n(handle, handlers, &message, NVerb::Set).await,
        CommandField::NActionRq => dispatch_n(handle, handlers, &message, NVerb::Action).await,
        CommandField::NCreateRq => dispatch_n(handle, handlers, &message, NVerb::Create).await,
        CommandField::NDeleteRq => dispatch_n(handle, handlers, &message, NVerb::Delete).await,
        CommandField::CCancelRq => {
            debug!("received C-CANCEL-RQ; no sub-operation tracking to cancel, ignoring");
            Ok(())
        }
        other => unimplemented(handle, other).await,
    }
}

enum StreamKind {
    Find,
    MoveOrGet,
}

enum NVerb {
    EventReport,
    Get,
    Set,
    Action,
    Create,
    Delete,
}

async fn dispatch_n<H: ServiceHandlers>(
    handle: &ServiceHandle,
    handlers: &Arc<H>,
    request: &DicomMessage,
    verb: NVerb,
) -> Result<()> {
    let outcome: Option<NServiceOutcome> = match verb {
        NVerb::EventReport => handlers.on_n_event_report_request(request).await,
        NVerb::Get => handlers.on_n_get_request(request).await,
        NVerb::Set => handlers.on_n_set_request(request).await,
        NVerb::Action => handlers.on_n_action_request(request).await,
        NVerb::Create => handlers.on_n_create_request(request).await,
        NVerb::Delete => handlers.on_n_delete_request(request).await,
    };
    match outcome {
        Some((status, dataset)) => {
            let response = dimse::build_response(request, status, dataset).context(DimseSnafu)?;
            handle.send_response(response).await
        }
        None => unimplemented(handle, request.command_field).await,
    }
}

async fn dispatch_streaming<H: ServiceHandlers>(
    handle: &ServiceHandle,
    handlers: Arc<H>,
    request: DicomMessage,
    association: &Association,
    kind: StreamKind,
) -> Result<()> {
    let dataset_transfer_syntax = association
        .context(request.presentation_context_id)
        .and_then(|pc| pc.accepted_transfer_syntax.clone());

    let (tx, mut rx) = mpsc::channel::<StreamingResponseItem>(4);
    let provider_request = request.clone();
    let provider_handlers = handlers.clone();
    let provider_task = tokio::spawn(async move {
        match kind {
            StreamKind::Find => provider_handlers.on_c_find_request(provider_request, tx).await,
            StreamKind::MoveOrGet => provider_handlers.on_c_move_request(provider_request, tx).await,
        }
    });

    let mut any = false;
    while let Some(item) = rx.recv().await {
        any = true;
        let mut response =
            dimse::build_response(&request, item.status, item.identifier).context(DimseSnafu)?;
        if response.dataset.is_some() {
            response.dataset_transfer_syntax = dataset_transfer_syntax.clone();
        }
        annotate_suboperations(&mut response.command, &item);
        handle.send_response(response).await?;
    }

    let handled = provider_task.await.unwrap_or(false);
    if !handled && !any {
        return unimplemented(handle, request.command_field).await;
    }
    Ok(())
}

fn annotate_suboperations(command: &mut InMemDicomObject, item: &StreamingResponseItem) {
    if let Some(n) = item.remaining_sub_operations {
        command.put(dimse::element_u16_value(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, n));
    }
    if let Some(n) = item.completed_sub_operations {
        command.put(dimse::element_u16_value(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, n));
    }
    if let Some(n) = item.failed_sub_operations {
        command.put(dimse::element_u16_value(tags::NUMBER_OF_FAILED_SUBOPERATIONS, n));
    }
    if let Some(n) = item.warning_sub_operations {
        command.put(dimse::element_u16_value(tags::NUMBER_OF_WARNING_SUBOPERATIONS, n));
    }
}

async fn run_sender(handle: ServiceHandle, transcoder: Arc<dyn DatasetTranscoder>) -> Result<()> {
    loop {
        let item = {
            let mut inner = handle.inner.lock().await;
            inner.msg_queue.pop_front()
        };

        let Some(item) = item else {
            if handle.is_closed().await {
                return Ok(());
            }
            tokio::select! {
                _ = handle.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            continue;
        };

        let (message, request_responder) = match item {
            Outgoing::Request { message, responder } => (message, Some(responder)),
            Outgoing::Response(message) => (message, None),
        };

        if request_responder.is_some() {
            loop {
                let ready = {
                    let inner = handle.inner.lock().await;
                    let max = inner
                        .association
                        .as_ref()
                        .map(|a| a.max_async_ops_invoked)
                        .unwrap_or(1);
                    max == 0 || inner.pending.len() < max as usize
                };
                if ready {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        match send_one(&handle, &transcoder, &message).await {
            Ok(true) => {
                if let Some(responder) = request_responder {
                    let message_id = message.message_id().unwrap_or(0);
                    let mut inner = handle.inner.lock().await;
                    inner.pending.insert(message_id, PendingRequest { responder });
                }
            }
            Ok(false) => {
                if let Some(responder) = request_responder {
                    if let Ok(response) = DicomMessage::sop_class_not_supported_response(&message) {
                        let _ = responder.send(response);
                    }
                } else {
                    warn!("dropping outgoing response: no acceptable presentation context for it");
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to send outgoing DIMSE message");
                if matches!(err, Error::Closed) {
                    return Ok(());
                }
            }
        }
    }
}

/// Send one DIMSE message over its negotiated presentation context.
/// Returns `Ok(false)` when no acceptable context exists yet (spec §4.5,
/// §7, §8 E4) rather than treating that as an I/O-level failure.
async fn send_one(
    handle: &ServiceHandle,
    transcoder: &Arc<dyn DatasetTranscoder>,
    message: &DicomMessage,
) -> Result<bool> {
    if handle.options.log_dimse_datasets {
        trace!(
            command_field = ?message.command_field,
            presentation_context_id = message.presentation_context_id,
            dataset = ?message.dataset,
            "sending DIMSE message"
        );
    }

    let pc: PresentationContext = {
        let inner = handle.inner.lock().await;
        let Some(pc) = inner.association.as_ref().and_then(|a| a.find_acceptable_pc(message).cloned()) else {
            return Ok(false);
        };
        pc
    };

    let mut dataset = message.dataset.clone();
    if let (Some(ds), Some(accepted_ts)) = (dataset.as_mut(), pc.accepted_transfer_syntax.as_deref()) {
        dimse::strip_group_lengths(ds);
        let from = message.dataset_transfer_syntax.as_deref().unwrap_or(accepted_ts);
        if from != accepted_ts {
            *ds = transcoder
                .transcode(ds, from, accepted_ts)
                .with_context(|_| TranscodeSnafu {
                    from: from.to_string(),
                    to: accepted_ts.to_string(),
                })?;
        }
    }

    let command_bytes = dimse::encode_command(&message.command, dataset.is_some()).context(DimseSnafu)?;

    let max_cmd = handle.options.effective_command_buffer();
    let max_data = handle.options.effective_data_buffer();
    let mut stream = PdvStream::new(handle.clone(), pc.id, max_cmd, max_data);
    stream.write(&command_bytes).await?;

    if let Some(ds) = &dataset {
        stream.set_is_command(false);
        let ts_uid = pc
            .accepted_transfer_syntax
            .as_deref()
            .unwrap_or("1.2.840.10008.1.2");
        let ts = TransferSyntaxRegistry
            .get(ts_uid)
            .unwrap_or_else(|| TransferSyntaxRegistry.get("1.2.840.10008.1.2").unwrap());
        let mut dataset_bytes = Vec::new();
        ds.write_dataset_with_ts(&mut dataset_bytes, ts)
            .context(EncodeDatasetSnafu)?;
        stream.write(&dataset_bytes).await?;
    }

    stream.flush(true).await?;
    Ok(true)
}

async fn run_writer<H, W>(mut write_half: W, handle: ServiceHandle, handlers: Arc<H>) -> Result<()>
where
    H: ServiceHandlers,
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let pdu = {
            let mut inner = handle.inner.lock().await;
            inner.pdu_queue.pop_front()
        };

        let Some(pdu) = pdu else {
            let close = {
                let inner = handle.inner.lock().await;
                inner.close_after_flush || inner.state == State::Closed
            };
            if close {
                let _ = write_half.shutdown().await;
                handle.close_connection(None, &*handlers).await;
                return Ok(());
            }
            tokio::select! {
                _ = handle.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            continue;
        };

        let mut buf = BytesMut::new();
        if let Err(source) = crate::pdu::write_pdu(&mut buf, &pdu) {
            warn!(error = %source, "failed to encode outgoing PDU, dropping it");
            continue;
        }

        if handle.options.log_data_pdus {
            if let Pdu::PData { data } = &pdu {
                for pdv in data {
                    trace!(
                        presentation_context_id = pdv.presentation_context_id,
                        is_command = matches!(pdv.value_type, crate::pdu::PDataValueType::Command),
                        is_last = pdv.is_last,
                        bytes = pdv.data.len(),
                        "sending P-DATA-TF PDV"
                    );
                }
            }
        }

        if let Err(source) = write_half.write_all(&buf).await {
            let err = Error::Transport { source };
            handle.close_connection(Some(err_ref_clone(&err)), &*handlers).await;
            return Err(err);
        }
    }
}
