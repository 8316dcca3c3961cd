//! Role upcalls: the host-overridable "bag of optional callbacks" the
//! service engine dispatches into (spec §5, §6, §9 "role upcalls as a
//! single trait").
//!
//! Rather than one dyn trait object per DIMSE verb, every upcall lives
//! on a single [`ServiceHandlers`] trait with a default, inert
//! implementation per method; a host overrides exactly the handlers it
//! cares about. `None`/`false` return values signal "not handled",
//! which the engine turns into the appropriate synthetic failure
//! response or, for the connection lifecycle notifications, simply
//! ignores (spec §6: "a handler that is never called is indistinguishable
//! from one that does nothing").
//!
//! Every method runs outside the engine's internal state lock: upcalls
//! may take arbitrarily long (a C-FIND provider querying a database, a
//! C-STORE sink writing to disk) without blocking PDU framing on the
//! wire (spec §5).

use std::future::Future;

use crate::assoc::Association;
use crate::dimse::{DicomMessage, Status};
use crate::pdu::{AbortRQSource, AssociationRJResult, AssociationRJSource};
use dicom_object::InMemDicomObject;
use tokio::sync::mpsc;

/// One item of a streaming C-FIND/C-MOVE/C-GET response (spec §4.5,
/// §8 E3): either an intermediate `Pending` match with its identifier,
/// or the final status that ends the operation.
#[derive(Debug, Clone)]
pub struct StreamingResponseItem {
    pub status: Status,
    pub identifier: Option<InMemDicomObject>,
    pub remaining_sub_operations: Option<u16>,
    pub completed_sub_operations: Option<u16>,
    pub failed_sub_operations: Option<u16>,
    pub warning_sub_operations: Option<u16>,
}

impl StreamingResponseItem {
    /// One `Pending` match, with sub-operation counts left unset (the
    /// common C-FIND case; C-MOVE/C-GET providers should use
    /// [`Self::pending_with_counts`] instead).
    pub fn pending(identifier: InMemDicomObject) -> Self {
        StreamingResponseItem {
            status: Status::new(0xff00),
            identifier: Some(identifier),
            remaining_sub_operations: None,
            completed_sub_operations: None,
            failed_sub_operations: None,
            warning_sub_operations: None,
        }
    }

    /// An intermediate C-MOVE/C-GET response carrying sub-operation
    /// progress counts but no identifier.
    pub fn pending_with_counts(remaining: u16, completed: u16, failed: u16, warning: u16) -> Self {
        StreamingResponseItem {
            status: Status::new(0xff00),
            identifier: None,
            remaining_sub_operations: Some(remaining),
            completed_sub_operations: Some(completed),
            failed_sub_operations: Some(failed),
            warning_sub_operations: Some(warning),
        }
    }

    /// The final item of the sequence, ending the operation.
    pub fn terminal(status: Status) -> Self {
        StreamingResponseItem {
            status,
            identifier: None,
            remaining_sub_operations: None,
            completed_sub_operations: None,
            failed_sub_operations: None,
            warning_sub_operations: None,
        }
    }
}

/// The outcome of an N-service request: the status to report, plus an
/// optional reply data set (N-GET/N-CREATE/N-EVENT-REPORT responses
/// commonly carry one; N-ACTION/N-SET/N-DELETE usually do not).
pub type NServiceOutcome = (Status, Option<InMemDicomObject>);

/// Everything the service engine may call out into the host for
/// (spec §6). Every method has a default, inert implementation;
/// override only the ones a given role needs.
#[allow(unused_variables)]
pub trait ServiceHandlers: Send + Sync {
    // -- connection/association lifecycle --------------------------------

    /// An association request was accepted and is now established
    /// (server role).
    fn on_receive_association_request(
        &self,
        association: &Association,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// An association request this node sent was accepted (client role).
    fn on_receive_association_accept(
        &self,
        association: &Association,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// An association request this node sent was rejected (client role).
    fn on_receive_association_reject(
        &self,
        result: AssociationRJResult,
        source: AssociationRJSource,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// The peer asked to release the association in an orderly fashion.
    fn on_receive_association_release_request(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// The peer confirmed the release this node requested.
    fn on_receive_association_release_response(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// The peer aborted the association.
    fn on_receive_abort(&self, source: AbortRQSource) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// The connection closed, for any reason: orderly release, abort,
    /// a transport error, or simple peer disconnect. Called exactly
    /// once per connection (spec §5, §8 invariant 7). `error` is `Some`
    /// only when the close was not a clean release.
    fn on_connection_closed(&self, error: Option<&crate::error::Error>) -> impl Future<Output = ()> + Send {
        async {}
    }

    // -- C-ECHO ------------------------------------------------------------

    /// Handle an incoming C-ECHO-RQ. `None` means no handler is
    /// registered; the engine aborts the association rather than leave
    /// the request unanswered.
    fn on_c_echo_request(&self, request: &DicomMessage) -> impl Future<Output = Option<Status>> + Send {
        async { None }
    }

    // -- C-STORE -------------------------------------------------------------

    /// Handle a fully reassembled C-STORE-RQ (the data set, if any, has
    /// already been parsed and handed off to the configured sink
    /// provider). `None` means no handler is registered.
    fn on_c_store_request(&self, request: &DicomMessage) -> impl Future<Output = Option<Status>> + Send {
        async { None }
    }

    /// A C-STORE request's data set could not be decoded after
    /// reassembly (spec §4.4, §7); `sink_name` identifies the spillover
    /// file when the default [`crate::sink::TempFileSink`] is in use.
    /// The engine has already sent a `ProcessingFailure` response and
    /// does not wait on this upcall to do so.
    fn on_c_store_request_exception(
        &self,
        sink_name: Option<&str>,
        reason: &str,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    // -- C-FIND / C-MOVE / C-GET (streaming) --------------------------------

    /// Handle a C-FIND-RQ, streaming zero or more `Pending` matches
    /// followed by a terminal status through `responses`. Returns
    /// `false` if no handler is registered (the engine then checks
    /// whether anything was streamed before aborting).
    fn on_c_find_request(
        &self,
        request: DicomMessage,
        responses: mpsc::Sender<StreamingResponseItem>,
    ) -> impl Future<Output = bool> + Send {
        async move {
            let _ = (request, responses);
            false
        }
    }

    /// Handle a C-MOVE-RQ or C-GET-RQ, streaming sub-operation progress
    /// and/or matches followed by a terminal status through `responses`.
    fn on_c_move_request(
        &self,
        request: DicomMessage,
        responses: mpsc::Sender<StreamingResponseItem>,
    ) -> impl Future<Output = bool> + Send {
        async move {
            let _ = (request, responses);
            false
        }
    }

    // -- N-service verbs -----------------------------------------------------

    fn on_n_event_report_request(
        &self,
        request: &DicomMessage,
    ) -> impl Future<Output = Option<NServiceOutcome>> + Send {
        async { None }
    }

    fn on_n_get_request(
        &self,
        request: &DicomMessage,
    ) -> impl Future<Output = Option<NServiceOutcome>> + Send {
        async { None }
    }

    fn on_n_set_request(
        &self,
        request: &DicomMessage,
    ) -> impl Future<Output = Option<NServiceOutcome>> + Send {
        async { None }
    }

    fn on_n_action_request(
        &self,
        request: &DicomMessage,
    ) -> impl Future<Output = Option<NServiceOutcome>> + Send {
        async { None }
    }

    fn on_n_create_request(
        &self,
        request: &DicomMessage,
    ) -> impl Future<Output = Option<NServiceOutcome>> + Send {
        async { None }
    }

    fn on_n_delete_request(
        &self,
        request: &DicomMessage,
    ) -> impl Future<Output = Option<NServiceOutcome>> + Send {
        async { None }
    }
}

/// The trivial handler set: every upcall is a no-op. Convenient for a
/// pure requestor (SCU) role that only ever sends requests and reads
/// responses back off `send_request`'s receiver, with nothing to
/// answer.
impl ServiceHandlers for () {}
