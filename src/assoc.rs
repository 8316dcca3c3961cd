//! The association model (spec §4.2, component C2).
//!
//! Pure data — the negotiated parameters of an established association —
//! plus the two pieces of negotiation logic the service engine calls
//! into: accepting a peer's proposed presentation contexts against a
//! policy, and picking the presentation context an outgoing message
//! should travel on.

use std::collections::BTreeMap;

use crate::dimse::DicomMessage;
use crate::options::AbstractSyntaxPolicy;
use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
};

/// A single negotiated presentation context, as recorded by the
/// association after the handshake completes (spec §3).
#[derive(Debug, Clone)]
pub struct PresentationContext {
    /// Odd identifier, unique within the association.
    pub id: u8,
    pub abstract_syntax: String,
    pub proposed_transfer_syntaxes: Vec<String>,
    pub accepted_transfer_syntax: Option<String>,
    pub result: PresentationContextResultReason,
    /// Whether the peer proposed to act as SCU/SCP for this abstract
    /// syntax via SCP/SCU Role Selection negotiation (PS3.7 Annex D.3.3.4).
    /// `false`/`false` when the peer proposed no role selection, which
    /// leaves the default roles (requestor SCU, acceptor SCP) in place.
    pub scu_role_supported: bool,
    pub scp_role_supported: bool,
}

impl PresentationContext {
    /// Whether this context was accepted by the peer/self.
    pub fn is_accepted(&self) -> bool {
        matches!(self.result, PresentationContextResultReason::Acceptance)
            && self.accepted_transfer_syntax.is_some()
    }
}

/// The negotiated parameters of an established association (spec §3).
#[derive(Debug, Clone, Default)]
pub struct Association {
    contexts: BTreeMap<u8, PresentationContext>,
    /// `0` means unbounded, capped by the host's own buffer configuration.
    pub max_pdu_length: u32,
    /// `0` means unbounded.
    pub max_async_ops_invoked: u16,
    pub remote_implementation_class_uid: Option<String>,
    pub remote_implementation_version_name: Option<String>,
    pub calling_ae_title: String,
    pub called_ae_title: String,
}

impl Association {
    /// Start building an association from the negotiated handshake
    /// parameters; presentation contexts are added separately via
    /// [`Self::accept_presentation_contexts`] or
    /// [`Self::record_accepted_contexts`].
    pub fn new(
        calling_ae_title: impl Into<String>,
        called_ae_title: impl Into<String>,
        max_pdu_length: u32,
    ) -> Self {
        Association {
            contexts: BTreeMap::new(),
            max_pdu_length,
            max_async_ops_invoked: 1,
            remote_implementation_class_uid: None,
            remote_implementation_version_name: None,
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
        }
    }

    /// Iterate the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> impl Iterator<Item = &PresentationContext> {
        self.contexts.values()
    }

    /// Look up a negotiated presentation context by id.
    pub fn context(&self, id: u8) -> Option<&PresentationContext> {
        self.contexts.get(&id)
    }

    /// Acceptor-side negotiation: apply `policy` to each proposed
    /// presentation context, producing both the wire-level
    /// `AssociationAC` results and this association's own record of
    /// what was accepted.
    ///
    /// Presentation context ids must be odd per PS3.8; a proposed
    /// context with an even id is rejected with `NoReason` without
    /// consulting the policy.
    ///
    /// `role_selections` carries the requestor's proposed SCP/SCU Role
    /// Selection items (abstract syntax, SCU supported, SCP supported),
    /// recorded against the matching context unchanged; the caller is
    /// responsible for echoing the same items back in the `AssociationAC`
    /// (PS3.7 Annex D.3.3.4: the acceptor does not negotiate roles, only
    /// confirms which of the two it is willing to support).
    pub fn accept_presentation_contexts(
        &mut self,
        proposed: &[PresentationContextProposed],
        policy: &dyn AbstractSyntaxPolicy,
        role_selections: &[(String, bool, bool)],
    ) -> Vec<PresentationContextResult> {
        let mut results = Vec::with_capacity(proposed.len());
        for pc in proposed {
            let (reason, transfer_syntax) = if pc.id % 2 == 0 {
                (PresentationContextResultReason::NoReason, None)
            } else {
                let outcome = policy.negotiate(pc);
                (outcome.reason, outcome.transfer_syntax)
            };

            let (scu_role_supported, scp_role_supported) = role_selections
                .iter()
                .find(|(uid, ..)| *uid == pc.abstract_syntax)
                .map(|(_, scu, scp)| (*scu, *scp))
                .unwrap_or((false, false));

            self.contexts.insert(
                pc.id,
                PresentationContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    proposed_transfer_syntaxes: pc.transfer_syntaxes.clone(),
                    accepted_transfer_syntax: transfer_syntax.clone(),
                    result: reason,
                    scu_role_supported,
                    scp_role_supported,
                },
            );

            results.push(PresentationContextResult {
                id: pc.id,
                reason,
                // a rejected context still needs a syntactically valid
                // transfer syntax item; the first proposed one is as
                // good as any since it will not be used.
                transfer_syntax: transfer_syntax
                    .or_else(|| pc.transfer_syntaxes.first().cloned())
                    .unwrap_or_else(|| "1.2.840.10008.1.2".to_string()),
            });
        }
        results
    }

    /// Requestor-side negotiation: record the peer's `AssociationAC`
    /// results against the contexts this node originally proposed.
    /// Contexts the peer left marked `Acceptance` without echoing back
    /// a context we did not propose are recorded as-is; entries this
    /// node proposed but the acceptor omitted entirely are implicitly
    /// rejected with `NoReason` (spec §3, "still flagged Proposed...
    /// auto-rejected").
    pub fn record_accepted_contexts(
        &mut self,
        proposed: &[PresentationContextProposed],
        accepted: &[PresentationContextResult],
    ) {
        for pc in proposed {
            let negotiated = accepted.iter().find(|r| r.id == pc.id);
            let (reason, transfer_syntax) = match negotiated {
                Some(r) if r.reason == PresentationContextResultReason::Acceptance => {
                    (r.reason, Some(r.transfer_syntax.clone()))
                }
                Some(r) => (r.reason, None),
                None => (PresentationContextResultReason::NoReason, None),
            };

            self.contexts.insert(
                pc.id,
                PresentationContext {
                    id: pc.id,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    proposed_transfer_syntaxes: pc.transfer_syntaxes.clone(),
                    accepted_transfer_syntax: transfer_syntax,
                    result: reason,
                    scu_role_supported: false,
                    scp_role_supported: false,
                },
            );
        }
    }

    /// Find an accepted presentation context suitable for sending
    /// `message` (spec §4.2).
    ///
    /// Rule: a context whose abstract syntax matches the message's SOP
    /// class and, for C-STORE, whose accepted transfer syntax exactly
    /// matches the dataset's current transfer syntax is preferred; any
    /// accepted context for the same abstract syntax is an acceptable
    /// fallback; finally the message's explicitly assigned context (if
    /// any) is used as a last resort. `None` means the message cannot
    /// be sent over this association.
    pub fn find_acceptable_pc(&self, message: &DicomMessage) -> Option<&PresentationContext> {
        let sop_class_uid = message.sop_class_uid()?;

        if message.command_field.is_c_store() {
            if let Some(ts) = message.dataset_transfer_syntax() {
                if let Some(pc) = self.contexts.values().find(|pc| {
                    pc.is_accepted()
                        && pc.abstract_syntax == sop_class_uid
                        && pc.accepted_transfer_syntax.as_deref() == Some(ts)
                }) {
                    return Some(pc);
                }
            }
        }

        if let Some(pc) = self
            .contexts
            .values()
            .find(|pc| pc.is_accepted() && pc.abstract_syntax == sop_class_uid)
        {
            return Some(pc);
        }

        let assigned = message.presentation_context_id;
        self.contexts
            .get(&assigned)
            .filter(|pc| pc.is_accepted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::KnownAbstractSyntaxes;

    fn proposed(id: u8, abstract_syntax: &str, ts: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: ts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn even_context_id_rejected_without_policy() {
        let mut assoc = Association::new("SCU", "SCP", 16_384);
        let policy = KnownAbstractSyntaxes {
            abstract_syntaxes: vec!["1.2.840.10008.1.1".to_string()],
            transfer_syntaxes: vec![],
            promiscuous: false,
        };
        let results = assoc.accept_presentation_contexts(
            &[proposed(2, "1.2.840.10008.1.1", &["1.2.840.10008.1.2"])],
            &policy,
            &[],
        );
        assert_eq!(results[0].reason, PresentationContextResultReason::NoReason);
    }

    #[test]
    fn find_acceptable_pc_prefers_store_transfer_syntax_match() {
        let mut assoc = Association::new("SCU", "SCP", 16_384);
        let policy = KnownAbstractSyntaxes {
            abstract_syntaxes: vec!["1.2.840.10008.5.1.4.1.1.7".to_string()],
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2".to_string(),
                "1.2.840.10008.1.2.1".to_string(),
            ],
            promiscuous: false,
        };
        assoc.accept_presentation_contexts(
            &[
                proposed(1, "1.2.840.10008.5.1.4.1.1.7", &["1.2.840.10008.1.2"]),
                proposed(3, "1.2.840.10008.5.1.4.1.1.7", &["1.2.840.10008.1.2.1"]),
            ],
            &policy,
            &[],
        );

        assert!(assoc.context(1).unwrap().is_accepted());
        assert!(assoc.context(3).unwrap().is_accepted());
    }

    #[test]
    fn role_selection_is_recorded_against_matching_abstract_syntax() {
        let mut assoc = Association::new("SCU", "SCP", 16_384);
        let policy = KnownAbstractSyntaxes {
            abstract_syntaxes: vec!["1.2.840.10008.5.1.4.1.1.7".to_string()],
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            promiscuous: false,
        };
        assoc.accept_presentation_contexts(
            &[proposed(1, "1.2.840.10008.5.1.4.1.1.7", &["1.2.840.10008.1.2"])],
            &policy,
            &[("1.2.840.10008.5.1.4.1.1.7".to_string(), true, false)],
        );

        let pc = assoc.context(1).unwrap();
        assert!(pc.scu_role_supported);
        assert!(!pc.scp_role_supported);
    }
}
