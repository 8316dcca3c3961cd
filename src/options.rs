//! Engine-wide configuration surface.
//!
//! [`ServiceOptions`] is the single place the host configures the engine:
//! negotiation-time parameters (AE title, application context, accepted
//! abstract/transfer syntaxes, access control policy, max PDU length) and
//! the runtime knobs named by the distilled specification
//! (`MaximumPDUsInQueue`, `MaxCommandBuffer`, `MaxDataBuffer`,
//! `UseRemoteAEForLogName`, `LogDataPDUs`, `LogDimseDatasets`).
//!
//! Follows `dicom_ul::association::server::ServerAssociationOptions`'s
//! `Cow<'a, str>` + chained-setter convention so that either borrowed
//! string literals or owned `String`s can be passed without an
//! allocation in the common case.

use std::borrow::Cow;

use crate::pdu::{PresentationContextProposed, UserIdentity, DEFAULT_MAX_PDU};

/// The standard DICOM application context name for the association
/// establishment service, PS3.7 Annex A.2.1.
pub const DEFAULT_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Default cap on the number of PDUs allowed to sit in the outbound
/// queue before `send_pdu` applies backpressure (spec §3, §4.5).
pub const DEFAULT_MAXIMUM_PDUS_IN_QUEUE: usize = 16;

/// Outcome of an access-control decision on an incoming association
/// request, reusing the PDU-level reject reason vocabulary.
pub type AccessResult = Result<(), crate::pdu::AssociationRJServiceUserReason>;

/// Common interface for application-entity access control policies.
///
/// Existing implementations are [`AcceptAny`] and [`AcceptCalledAeTitle`];
/// hosts are free to implement their own (e.g. an AE title allow-list
/// backed by a configuration file).
pub trait AccessControl: Send + Sync {
    /// Decide whether to grant the incoming association request.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> AccessResult;
}

/// Accepts every incoming association request unconditionally.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> AccessResult {
        Ok(())
    }
}

/// Accepts only requests whose called AE title matches this node's own.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> AccessResult {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(crate::pdu::AssociationRJServiceUserReason::CalledAeTitleNotRecognized)
        }
    }
}

/// The outcome of negotiating a single proposed presentation context.
#[derive(Debug, Clone)]
pub struct NegotiatedContext {
    pub transfer_syntax: Option<String>,
    pub reason: crate::pdu::PresentationContextResultReason,
}

/// Common interface for abstract-syntax / transfer-syntax negotiation
/// policies, the collaborator `accept_presentation_contexts` (spec §4.2)
/// consults for each proposed presentation context.
pub trait AbstractSyntaxPolicy: Send + Sync {
    /// Decide the outcome for one proposed presentation context.
    fn negotiate(&self, proposed: &PresentationContextProposed) -> NegotiatedContext;
}

/// The default policy: accept a configured (or, in promiscuous mode, any)
/// set of abstract syntaxes, picking the first proposed transfer syntax
/// that is also present in the configured list (or, if none are
/// configured, the first proposed transfer syntax at all).
#[derive(Debug, Clone)]
pub struct KnownAbstractSyntaxes {
    pub abstract_syntaxes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    pub promiscuous: bool,
}

impl Default for KnownAbstractSyntaxes {
    fn default() -> Self {
        KnownAbstractSyntaxes {
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: Vec::new(),
            promiscuous: false,
        }
    }
}

impl AbstractSyntaxPolicy for KnownAbstractSyntaxes {
    fn negotiate(&self, proposed: &PresentationContextProposed) -> NegotiatedContext {
        if !self.promiscuous && !self.abstract_syntaxes.iter().any(|a| a == &proposed.abstract_syntax) {
            return NegotiatedContext {
                transfer_syntax: None,
                reason: crate::pdu::PresentationContextResultReason::AbstractSyntaxNotSupported,
            };
        }

        let chosen = if self.transfer_syntaxes.is_empty() {
            proposed.transfer_syntaxes.first().cloned()
        } else {
            proposed
                .transfer_syntaxes
                .iter()
                .find(|ts| self.transfer_syntaxes.iter().any(|known| known == *ts))
                .cloned()
        };

        match chosen {
            Some(ts) => NegotiatedContext {
                transfer_syntax: Some(ts),
                reason: crate::pdu::PresentationContextResultReason::Acceptance,
            },
            None => NegotiatedContext {
                transfer_syntax: None,
                reason: crate::pdu::PresentationContextResultReason::TransferSyntaxesNotSupported,
            },
        }
    }
}

/// Engine-wide configuration, covering both negotiation-time parameters
/// and the runtime flow-control/logging knobs.
///
/// Values are set through the chained builder methods and consumed by
/// [`crate::service::ServiceEngine`].
#[derive(Debug, Clone)]
pub struct ServiceOptions<'a> {
    pub(crate) ae_title: Cow<'a, str>,
    pub(crate) application_context_name: Cow<'a, str>,
    pub(crate) max_pdu_length: u32,
    pub(crate) max_command_buffer: u32,
    pub(crate) max_data_buffer: u32,
    pub(crate) maximum_pdus_in_queue: usize,
    pub(crate) max_async_ops_invoked: u16,
    pub(crate) use_remote_ae_for_log_name: bool,
    pub(crate) log_data_pdus: bool,
    pub(crate) log_dimse_datasets: bool,
    pub(crate) strict: bool,
}

impl<'a> Default for ServiceOptions<'a> {
    fn default() -> Self {
        ServiceOptions {
            ae_title: Cow::Borrowed("THIS-SCP"),
            application_context_name: Cow::Borrowed(DEFAULT_APPLICATION_CONTEXT_NAME),
            max_pdu_length: DEFAULT_MAX_PDU,
            max_command_buffer: DEFAULT_MAX_PDU,
            max_data_buffer: DEFAULT_MAX_PDU,
            maximum_pdus_in_queue: DEFAULT_MAXIMUM_PDUS_IN_QUEUE,
            max_async_ops_invoked: 1,
            use_remote_ae_for_log_name: false,
            log_data_pdus: false,
            log_dimse_datasets: false,
            strict: true,
        }
    }
}

impl<'a> ServiceOptions<'a> {
    /// Create a new, default options set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set this node's own AE title.
    pub fn ae_title(mut self, ae_title: impl Into<Cow<'a, str>>) -> Self {
        self.ae_title = ae_title.into();
        self
    }

    /// Set the application context name (rarely anything other than the
    /// standard value).
    pub fn application_context_name(mut self, name: impl Into<Cow<'a, str>>) -> Self {
        self.application_context_name = name.into();
        self
    }

    /// Set the maximum PDU length this node is willing to receive.
    /// `0` is accepted but is equivalent to "no explicit limit": the
    /// engine still caps outgoing PDUs at `max_command_buffer` /
    /// `max_data_buffer` (spec §4.3, Open Question in §9).
    pub fn max_pdu_length(mut self, len: u32) -> Self {
        self.max_pdu_length = len;
        self
    }

    /// Cap on the size of a single P-DATA-TF PDU carrying command
    /// fragments, independent of the negotiated `max_pdu_length`.
    pub fn max_command_buffer(mut self, len: u32) -> Self {
        self.max_command_buffer = len;
        self
    }

    /// Cap on the size of a single P-DATA-TF PDU carrying dataset
    /// fragments, independent of the negotiated `max_pdu_length`.
    pub fn max_data_buffer(mut self, len: u32) -> Self {
        self.max_data_buffer = len;
        self
    }

    /// `MaximumPDUsInQueue`: the outbound backpressure threshold.
    pub fn maximum_pdus_in_queue(mut self, n: usize) -> Self {
        self.maximum_pdus_in_queue = n;
        self
    }

    /// The async-ops-invoked window this node will offer during
    /// negotiation. `0` means unbounded.
    pub fn max_async_ops_invoked(mut self, n: u16) -> Self {
        self.max_async_ops_invoked = n;
        self
    }

    /// `UseRemoteAEForLogName`: once the handshake completes, swap the
    /// connection's logging identity (the `log_id` span field) to the
    /// remote AE title instead of keeping the locally assigned one.
    pub fn use_remote_ae_for_log_name(mut self, yes: bool) -> Self {
        self.use_remote_ae_for_log_name = yes;
        self
    }

    /// `LogDataPDUs`: trace-level dumps of raw P-DATA-TF PDU contents.
    pub fn log_data_pdus(mut self, yes: bool) -> Self {
        self.log_data_pdus = yes;
        self
    }

    /// `LogDimseDatasets`: trace-level dumps of decoded DIMSE datasets.
    pub fn log_dimse_datasets(mut self, yes: bool) -> Self {
        self.log_dimse_datasets = yes;
        self
    }

    /// Reject a PDU declaring a length past the negotiated
    /// `max_pdu_length` rather than tolerating it up to the engine's
    /// absolute sanity cap (spec §4.1, mirroring `dicom_ul`'s own
    /// `strict` association option). Defaults to `true`.
    pub fn strict(mut self, yes: bool) -> Self {
        self.strict = yes;
        self
    }

    /// The effective cap for a single command-mode PDV stream buffer:
    /// `min(max_pdu_length, max_command_buffer)`, treating
    /// `max_pdu_length == 0` as "unbounded" (spec §4.3).
    pub fn effective_command_buffer(&self) -> u32 {
        effective_max(self.max_pdu_length, self.max_command_buffer)
    }

    /// As [`Self::effective_command_buffer`], for dataset-mode PDVs.
    pub fn effective_data_buffer(&self) -> u32 {
        effective_max(self.max_pdu_length, self.max_data_buffer)
    }
}

pub(crate) fn effective_max(pdu_max: u32, mode_buffer: u32) -> u32 {
    if pdu_max == 0 {
        mode_buffer
    } else {
        pdu_max.min(mode_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PresentationContextProposed;

    #[test]
    fn effective_max_treats_zero_pdu_as_unbounded() {
        assert_eq!(effective_max(0, 16_384), 16_384);
        assert_eq!(effective_max(4_096, 16_384), 4_096);
        assert_eq!(effective_max(32_768, 16_384), 16_384);
    }

    #[test]
    fn accept_called_ae_title_matches_exactly() {
        let policy = AcceptCalledAeTitle;
        assert!(policy.check_access("STORESCP", "ANYONE", "STORESCP", None).is_ok());
        assert!(policy.check_access("STORESCP", "ANYONE", "OTHER", None).is_err());
    }

    #[test]
    fn known_abstract_syntaxes_rejects_unknown() {
        let policy = KnownAbstractSyntaxes {
            abstract_syntaxes: vec!["1.2.840.10008.1.1".to_string()],
            transfer_syntaxes: vec![],
            promiscuous: false,
        };
        let proposed = PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        };
        let outcome = policy.negotiate(&proposed);
        assert_eq!(
            outcome.reason,
            crate::pdu::PresentationContextResultReason::AbstractSyntaxNotSupported
        );
    }

    #[test]
    fn known_abstract_syntaxes_picks_first_known_transfer_syntax() {
        let policy = KnownAbstractSyntaxes {
            abstract_syntaxes: vec!["1.2.840.10008.1.1".to_string()],
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2.1".to_string(),
                "1.2.840.10008.1.2".to_string(),
            ],
            promiscuous: false,
        };
        let proposed = PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2".to_string(),
                "1.2.840.10008.1.2.1".to_string(),
            ],
        };
        let outcome = policy.negotiate(&proposed);
        assert_eq!(outcome.transfer_syntax.as_deref(), Some("1.2.840.10008.1.2.1"));
    }

    #[test]
    fn promiscuous_accepts_unknown_abstract_syntax() {
        let policy = KnownAbstractSyntaxes {
            abstract_syntaxes: vec![],
            transfer_syntaxes: vec![],
            promiscuous: true,
        };
        let proposed = PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.3.4.5".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        };
        let outcome = policy.negotiate(&proposed);
        assert_eq!(
            outcome.reason,
            crate::pdu::PresentationContextResultReason::Acceptance
        );
    }
}
