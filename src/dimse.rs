//! DIMSE message model: command sets, command fields, and status codes.
//!
//! The service engine treats a DIMSE message as a `(command, dataset)`
//! pair attached to a presentation context (spec §3). Command sets are
//! represented with [`InMemDicomObject`], the same in-memory dataset type
//! `dicom-object` uses elsewhere in the workspace, rather than a bespoke
//! struct per command — this lets command elements be read and written
//! with the ordinary `dicom-core`/`dicom-object` element API, in the
//! manner of `dicom_ul::pdu::commands`.

use dicom_core::value::{CastValueError, ConvertValueError};
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::{AccessByNameError, InMemDicomObject, ReadError, WriteError};
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("failed to decode command set"))]
    DecodeCommand { source: ReadError },

    #[snafu(display("failed to encode command set"))]
    EncodeCommand { source: WriteError },

    #[snafu(display("command set is missing required element `{name}`"))]
    MissingElement { name: &'static str },

    #[snafu(display("could not read element `{name}`"))]
    AccessElement {
        name: &'static str,
        source: AccessByNameError,
    },

    #[snafu(display("could not interpret element `{name}` as the expected type"))]
    CastElement {
        name: &'static str,
        source: CastValueError,
    },

    #[snafu(display("could not convert element `{name}` to the expected type"))]
    ConvertElement {
        name: &'static str,
        source: ConvertValueError,
    },

    #[snafu(display("unrecognized command field {value:#06x}"))]
    UnknownCommandField { value: u16 },

    #[snafu(display("command field {field:?} is a response, not a request"))]
    NotARequest { field: CommandField },

    #[snafu(display("unrecognized status state for status code {code:#06x}"))]
    UnknownStatus { code: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// DIMSE priority (PS3.7 E.2), carried by request command sets that
/// support it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Priority {
    Medium = 0x0000,
    High = 0x0001,
    Low = 0x0002,
}

impl Priority {
    fn from_u16(value: u16) -> Self {
        match value {
            0x0001 => Priority::High,
            0x0002 => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// Whether a command set is followed by a data set (PS3.7 E.1, element
/// `(0000,0800)`).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
enum CommandDatasetType {
    Present = 0x0001,
    Absent = 0x0101,
}

/// The command field of a DIMSE command set (PS3.7 E.1, element
/// `(0000,0100)`).
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0fff,
}

impl CommandField {
    pub fn from_u16(value: u16) -> Result<Self> {
        Ok(match value {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            0x0fff => CommandField::CCancelRq,
            value => return UnknownCommandFieldSnafu { value }.fail(),
        })
    }

    /// Whether this is a request (as opposed to a response/confirmation).
    pub fn is_request(self) -> bool {
        !matches!(self as u16 & 0x8000, 0x8000)
    }

    pub fn is_c_store(self) -> bool {
        matches!(self, CommandField::CStoreRq | CommandField::CStoreRsp)
    }

    /// Whether this command, per the standard, may stream multiple
    /// `Pending` responses before a terminal one (spec §4.5, §8 E3).
    pub fn allows_pending_responses(self) -> bool {
        matches!(
            self,
            CommandField::CFindRsp | CommandField::CMoveRsp | CommandField::CGetRsp
        )
    }

    /// The response command field for this request, if this is one.
    pub fn response(self) -> Option<CommandField> {
        Some(match self {
            CommandField::CStoreRq => CommandField::CStoreRsp,
            CommandField::CGetRq => CommandField::CGetRsp,
            CommandField::CFindRq => CommandField::CFindRsp,
            CommandField::CMoveRq => CommandField::CMoveRsp,
            CommandField::CEchoRq => CommandField::CEchoRsp,
            CommandField::NEventReportRq => CommandField::NEventReportRsp,
            CommandField::NGetRq => CommandField::NGetRsp,
            CommandField::NSetRq => CommandField::NSetRsp,
            CommandField::NActionRq => CommandField::NActionRsp,
            CommandField::NCreateRq => CommandField::NCreateRsp,
            CommandField::NDeleteRq => CommandField::NDeleteRsp,
            _ => return None,
        })
    }
}

/// The terminal or intermediate outcome of a DIMSE operation (status
/// code classes, PS3.7 Annex C).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StatusState {
    Success,
    Pending,
    Warning,
    Failure,
    Cancel,
}

impl StatusState {
    /// Whether a pending request should remain in the engine's
    /// in-flight table after receiving a response with this state
    /// (spec §3, §4.5, §8 invariant 6).
    pub fn is_pending(self) -> bool {
        matches!(self, StatusState::Pending)
    }

    fn from_code(code: u16) -> Self {
        match code {
            0x0000 => StatusState::Success,
            0xff00 | 0xff01 => StatusState::Pending,
            0xfe00 => StatusState::Cancel,
            c if c & 0xf000 == 0xb000 => StatusState::Warning,
            _ => StatusState::Failure,
        }
    }
}

/// A DIMSE status (element `(0000,0900)`), plus the raw code for
/// precise reporting.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Status {
    pub state: StatusState,
    pub code: u16,
}

impl Status {
    pub fn new(code: u16) -> Self {
        Status {
            state: StatusState::from_code(code),
            code,
        }
    }

    pub const SUCCESS: Status = Status {
        state: StatusState::Success,
        code: 0x0000,
    };

    /// `0x0122`: Refused: SOP Class Not Supported (PS3.7 Annex C.2.3),
    /// used for requests naming an abstract syntax with no accepted
    /// presentation context.
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status {
        state: StatusState::Failure,
        code: 0x0122,
    };

    pub const PROCESSING_FAILURE: Status = Status {
        state: StatusState::Failure,
        code: 0x0110,
    };
}

/// A DIMSE message: a command set, an optional data set, and the
/// presentation context it travels (or will travel) on (spec §3).
#[derive(Debug, Clone)]
pub struct DicomMessage {
    pub command: InMemDicomObject,
    pub dataset: Option<InMemDicomObject>,
    pub presentation_context_id: u8,
    pub command_field: CommandField,
    /// The transfer syntax the dataset is (or should be) encoded with;
    /// `None` for messages without a data set. Kept alongside the
    /// dataset because `InMemDicomObject` does not track it once
    /// decoded in isolation from file-meta information.
    pub dataset_transfer_syntax: Option<String>,
}

impl DicomMessage {
    /// The SOP class UID this message concerns: `AffectedSOPClassUID`
    /// for most commands, falling back to `RequestedSOPClassUID` for
    /// C-GET/C-MOVE sub-operations that name it instead.
    pub fn sop_class_uid(&self) -> Option<String> {
        element_str(&self.command, tags::AFFECTED_SOP_CLASS_UID)
            .or_else(|| element_str(&self.command, tags::REQUESTED_SOP_CLASS_UID))
    }

    pub fn dataset_transfer_syntax(&self) -> Option<&str> {
        self.dataset_transfer_syntax.as_deref()
    }

    pub fn message_id(&self) -> Option<u16> {
        element_u16(&self.command, tags::MESSAGE_ID)
    }

    pub fn request_message_id(&self) -> Option<u16> {
        element_u16(&self.command, tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn status(&self) -> Option<Status> {
        element_u16(&self.command, tags::STATUS).map(Status::new)
    }

    pub fn priority(&self) -> Priority {
        element_u16(&self.command, tags::PRIORITY)
            .map(Priority::from_u16)
            .unwrap_or(Priority::Medium)
    }

    /// Construct the synthetic `SOPClassNotSupported` response the
    /// engine returns from `post_response` when no presentation
    /// context could be found for a request (spec §4.5, §7, §8 E4).
    pub fn sop_class_not_supported_response(request: &DicomMessage) -> Result<DicomMessage> {
        let response_field = request.command_field.response().context(NotARequestSnafu {
            field: request.command_field,
        })?;
        let message_id = request.message_id().unwrap_or(0);
        let sop_class_uid = request.sop_class_uid().unwrap_or_default();

        let mut command = InMemDicomObject::new_empty();
        command.put(element_str_value(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            &sop_class_uid,
        ));
        command.put(element_u16_value(
            tags::COMMAND_FIELD,
            response_field as u16,
        ));
        command.put(element_u16_value(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            message_id,
        ));
        command.put(element_u16_value(
            tags::COMMAND_DATA_SET_TYPE,
            CommandDatasetType::Absent as u16,
        ));
        command.put(element_u16_value(
            tags::STATUS,
            Status::SOP_CLASS_NOT_SUPPORTED.code,
        ));

        Ok(DicomMessage {
            command,
            dataset: None,
            presentation_context_id: request.presentation_context_id,
            command_field: response_field,
            dataset_transfer_syntax: None,
        })
    }

    /// Construct a `ProcessingFailure` C-STORE response for a request
    /// whose data set could not be decoded (spec §4.4, §7).
    pub fn c_store_processing_failure_response(request: &DicomMessage) -> DicomMessage {
        let message_id = request.message_id().unwrap_or(0);
        let sop_class_uid = request.sop_class_uid().unwrap_or_default();
        let sop_instance_uid =
            element_str(&request.command, tags::AFFECTED_SOP_INSTANCE_UID).unwrap_or_default();

        let mut command = InMemDicomObject::new_empty();
        command.put(element_str_value(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            &sop_class_uid,
        ));
        command.put(element_u16_value(
            tags::COMMAND_FIELD,
            CommandField::CStoreRsp as u16,
        ));
        command.put(element_u16_value(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id));
        command.put(element_u16_value(
            tags::COMMAND_DATA_SET_TYPE,
            CommandDatasetType::Absent as u16,
        ));
        command.put(element_u16_value(tags::STATUS, Status::PROCESSING_FAILURE.code));
        command.put(element_str_value(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            &sop_instance_uid,
        ));

        DicomMessage {
            command,
            dataset: None,
            presentation_context_id: request.presentation_context_id,
            command_field: CommandField::CStoreRsp,
            dataset_transfer_syntax: None,
        }
    }
}

/// Strip group-length elements (tag element number `0x0000`) from a
/// dataset before transmission, per PS3.5 §7.2 (spec §4.5).
pub fn strip_group_lengths(obj: &mut InMemDicomObject) {
    let group_length_tags: Vec<Tag> = obj
        .iter()
        .map(|elt| elt.tag())
        .filter(|tag| tag.element() == 0x0000)
        .collect();
    for tag in group_length_tags {
        obj.remove_element(tag);
    }
}

/// Encode a command set to implicit-VR little-endian bytes (the
/// command stream's fixed encoding per spec §3), inserting/overwriting
/// `CommandGroupLength` and `CommandDataSetType` as needed.
pub fn encode_command(command: &InMemDicomObject, dataset_present: bool) -> Result<Vec<u8>> {
    let mut command = command.clone();
    command.put(element_u16_value(
        tags::COMMAND_DATA_SET_TYPE,
        if dataset_present {
            CommandDatasetType::Present as u16
        } else {
            CommandDatasetType::Absent as u16
        },
    ));

    // the group length element itself does not count towards the
    // length it reports; measure everything else first.
    command.remove_element(tags::COMMAND_GROUP_LENGTH);
    let mut body = Vec::new();
    command
        .write_dataset_with_ts(&mut body, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(EncodeCommandSnafu)?;

    command.put(element_u32_value(tags::COMMAND_GROUP_LENGTH, body.len() as u32));
    let mut out = Vec::with_capacity(body.len() + 12);
    command
        .write_dataset_with_ts(&mut out, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(EncodeCommandSnafu)?;
    Ok(out)
}

/// Decode a command set from its implicit-VR little-endian wire bytes,
/// returning the parsed command field alongside the dataset.
pub fn decode_command(bytes: &[u8]) -> Result<(CommandField, InMemDicomObject)> {
    let obj = InMemDicomObject::read_dataset_with_ts(bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(DecodeCommandSnafu)?;
    let field = element_u16(&obj, tags::COMMAND_FIELD).context(MissingElementSnafu {
        name: "CommandField",
    })?;
    Ok((CommandField::from_u16(field)?, obj))
}

/// Whether the decoded command set declares a following data set.
pub fn command_has_dataset(command: &InMemDicomObject) -> bool {
    element_u16(command, tags::COMMAND_DATA_SET_TYPE)
        .map(|v| v != CommandDatasetType::Absent as u16)
        .unwrap_or(false)
}

/// Construct a generic response message for `request`: sets the command
/// field to the request's response field, copies the affected SOP class
/// UID and message id, and attaches `dataset` if given. The shared shape
/// behind C-ECHO, C-FIND/C-MOVE per-item, and N-service replies (spec
/// §4.5, §6); C-STORE responses additionally copy `AffectedSOPInstanceUID`
/// (see [`c_store_processing_failure_response`] for that one extra put).
pub fn build_response(
    request: &DicomMessage,
    status: Status,
    dataset: Option<InMemDicomObject>,
) -> Result<DicomMessage> {
    let response_field = request.command_field.response().context(NotARequestSnafu {
        field: request.command_field,
    })?;
    let message_id = request.message_id().unwrap_or(0);
    let sop_class_uid = request.sop_class_uid().unwrap_or_default();

    let mut command = InMemDicomObject::new_empty();
    command.put(element_str_value(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        &sop_class_uid,
    ));
    command.put(element_u16_value(
        tags::COMMAND_FIELD,
        response_field as u16,
    ));
    command.put(element_u16_value(
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        message_id,
    ));
    command.put(element_u16_value(
        tags::COMMAND_DATA_SET_TYPE,
        if dataset.is_some() {
            CommandDatasetType::Present as u16
        } else {
            CommandDatasetType::Absent as u16
        },
    ));
    command.put(element_u16_value(tags::STATUS, status.code));

    Ok(DicomMessage {
        command,
        dataset,
        presentation_context_id: request.presentation_context_id,
        command_field: response_field,
        dataset_transfer_syntax: None,
    })
}

pub(crate) fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.value().to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
}

pub(crate) fn element_u16(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.value().to_int().ok())
}

pub(crate) fn element_str_value(tag: Tag, vr: VR, value: &str) -> InMemElement {
    DataElement::new(tag, vr, dicom_value!(Str, value.to_string()))
}

pub(crate) fn element_u16_value(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

pub(crate) fn element_u32_value(tag: Tag, value: u32) -> InMemElement {
    DataElement::new(tag, VR::UL, dicom_value!(U32, [value]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_field_roundtrips() {
        for field in [
            CommandField::CStoreRq,
            CommandField::CStoreRsp,
            CommandField::CFindRq,
            CommandField::CEchoRsp,
            CommandField::NActionRq,
        ] {
            let code = field as u16;
            assert_eq!(CommandField::from_u16(code).unwrap() as u16, code);
        }
    }

    #[test]
    fn status_state_classification() {
        assert_eq!(Status::new(0x0000).state, StatusState::Success);
        assert_eq!(Status::new(0xff00).state, StatusState::Pending);
        assert_eq!(Status::new(0xfe00).state, StatusState::Cancel);
        assert_eq!(Status::new(0xb000).state, StatusState::Warning);
        assert_eq!(Status::new(0xa700).state, StatusState::Failure);
    }

    #[test]
    fn encode_then_decode_c_echo_rq() {
        let mut command = InMemDicomObject::new_empty();
        command.put(element_str_value(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            "1.2.840.10008.1.1",
        ));
        command.put(element_u16_value(tags::COMMAND_FIELD, CommandField::CEchoRq as u16));
        command.put(element_u16_value(tags::MESSAGE_ID, 1));
        command.put(element_u16_value(tags::PRIORITY, Priority::Medium as u16));

        let bytes = encode_command(&command, false).unwrap();
        let (field, decoded) = decode_command(&bytes).unwrap();
        assert_eq!(field, CommandField::CEchoRq);
        assert_eq!(element_u16(&decoded, tags::MESSAGE_ID), Some(1));
        assert!(!command_has_dataset(&decoded));
        assert!(decoded.element(tags::COMMAND_GROUP_LENGTH).is_ok());
    }

    #[test]
    fn sop_class_not_supported_response_carries_request_message_id() {
        let mut command = InMemDicomObject::new_empty();
        command.put(element_str_value(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            "1.2.840.10008.5.1.4.1.1.7",
        ));
        command.put(element_u16_value(tags::COMMAND_FIELD, CommandField::CStoreRq as u16));
        command.put(element_u16_value(tags::MESSAGE_ID, 42));
        let request = DicomMessage {
            command,
            dataset: None,
            presentation_context_id: 1,
            command_field: CommandField::CStoreRq,
            dataset_transfer_syntax: None,
        };

        let response = DicomMessage::sop_class_not_supported_response(&request).unwrap();
        assert_eq!(response.request_message_id(), Some(42));
        assert_eq!(response.status().unwrap().state, StatusState::Failure);
    }
}
