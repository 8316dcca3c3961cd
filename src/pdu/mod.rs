//! DICOM upper layer protocol data units.
//!
//! This module holds the data model for the seven A-PDUs and the
//! P-DATA-TF framing described by PS3.8, plus their TLV sub-items. It is
//! deliberately a plain data model: encoding and decoding live in
//! [`writer`] and [`reader`] respectively.

use std::convert::TryFrom;

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size proposed when none is configured.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size, as specified by the standard.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size, as specified by the standard.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the 6-byte PDU header (type + reserved + big-endian length).
pub const PDU_HEADER_SIZE: u32 = 6;

/// A presentation context as proposed by an association requestor.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PresentationContextProposed {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context as accepted or rejected by an association acceptor.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl TryFrom<u8> for PresentationContextResultReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => return Err(()),
        })
    }
}

/// The type of identity material carried by a user identity negotiation item.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum UserIdentityType {
    Username = 1,
    UsernamePasscode = 2,
    Kerberos = 3,
    Saml = 4,
    Jwt = 5,
}

impl UserIdentityType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => UserIdentityType::Username,
            2 => UserIdentityType::UsernamePasscode,
            3 => UserIdentityType::Kerberos,
            4 => UserIdentityType::Saml,
            5 => UserIdentityType::Jwt,
            _ => return None,
        })
    }
}

/// User identity negotiation sub-item (PS3.7 Annex D.3.3.7).
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct UserIdentity {
    pub positive_response_requested: bool,
    pub identity_type: UserIdentityType,
    pub primary_field: Vec<u8>,
    pub secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }
}

/// A sub-item of the User Information item (PS3.7 Annex D.3.3).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum UserVariableItem {
    /// Maximum length (in bytes) of the variable field of P-DATA-TF PDUs.
    /// 0 means "no maximum specified".
    MaxLength(u32),
    ImplementationClassUID(String),
    ImplementationVersionName(String),
    /// Asynchronous Operations Window negotiation (sub-item `0x53`).
    AsyncOperationsWindow {
        max_ops_invoked: u16,
        max_ops_performed: u16,
    },
    /// SCP/SCU role selection negotiation (sub-item `0x54`), one per
    /// abstract syntax for which a non-default role is requested.
    RoleSelection {
        sop_class_uid: String,
        scu_role_supported: bool,
        scp_role_supported: bool,
    },
    SopClassExtendedNegotiation(String, Vec<u8>),
    UserIdentity(UserIdentity),
    /// An unrecognized sub-item, kept verbatim so forward-compatible
    /// peers are not rejected outright.
    Unknown(u8, Vec<u8>),
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven = 1,
    ApplicationContextNameNotSupported = 2,
    CallingAeTitleNotRecognized = 3,
    CalledAeTitleNotRecognized = 7,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven = 1,
    ProtocolVersionNotSupported = 2,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion = 1,
    LocalLimitExceeded = 2,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecifiedUnrecognizedPdu = 1,
    UnexpectedPdu = 2,
    UnrecognizedPduParameter = 4,
    UnexpectedPduParameter = 5,
    InvalidPduParameter = 6,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
}

/// A single fragment of a command or data set, carried inside a
/// P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// A DICOM upper layer protocol data unit.
#[derive(Clone, PartialEq, Debug)]
pub enum Pdu {
    AssociationRQ(AssociationRQ),
    AssociationAC(AssociationAC),
    AssociationRJ(AssociationRJ),
    PData { data: Vec<PDataValue> },
    ReleaseRQ,
    ReleaseRP,
    AbortRQ { source: AbortRQSource },
    /// A PDU of an unrecognized type, including the reserved no-op `0xFF`.
    /// Kept so callers can choose to log and ignore it (see spec §4.5,
    /// "type 0xFF is ignored").
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// The 1-byte PDU type code as it appears on the wire.
    pub fn pdu_type(&self) -> u8 {
        match self {
            Pdu::AssociationRQ(_) => 0x01,
            Pdu::AssociationAC(_) => 0x02,
            Pdu::AssociationRJ(_) => 0x03,
            Pdu::PData { .. } => 0x04,
            Pdu::ReleaseRQ => 0x05,
            Pdu::ReleaseRP => 0x06,
            Pdu::AbortRQ { .. } => 0x07,
            Pdu::Unknown { pdu_type, .. } => *pdu_type,
        }
    }
}

#[cfg(test)]
mod test;
