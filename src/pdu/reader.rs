//! Decoding of upper layer PDUs from their wire representation.
//!
//! [`read_pdu`] is a streaming decoder in the style of a `tokio_util`
//! codec: given a growing [`BytesMut`] fed by the transport, it returns
//! `Ok(None)` until a full PDU is buffered, at which point it consumes
//! exactly that PDU's bytes and returns it. It never blocks and never
//! touches the byte stream itself.

use std::convert::TryFrom;

use bytes::BytesMut;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderAcseReason,
    AssociationRJServiceProviderPresentationReason, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    UserIdentity, UserIdentityType, UserVariableItem, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("PDU or item ended before `{field}` could be read"))]
    UnexpectedEof { field: &'static str },

    #[snafu(display("PDU of {length} bytes exceeds the maximum of {max}"))]
    PduTooLarge { length: u32, max: u32 },

    #[snafu(display("invalid UTF-8 in `{field}`"))]
    InvalidUtf8 {
        field: &'static str,
        source: std::str::Utf8Error,
    },

    #[snafu(display("expected item type {expected:#04x}, found {found:#04x}"))]
    UnexpectedItemType { expected: u8, found: u8 },

    #[snafu(display("unrecognized presentation context result reason {value}"))]
    UnknownResultReason { value: u8 },

    #[snafu(display("unrecognized association reject source {value}"))]
    UnknownRejectSource { value: u8 },

    #[snafu(display("unrecognized user identity type {value}"))]
    UnknownUserIdentityType { value: u8 },

    #[snafu(display("PDV message control header {value:#04x} has reserved bits set"))]
    ReservedControlBits { value: u8 },

    #[snafu(display("{pdu} proposes no presentation contexts"))]
    MissingPresentationContexts { pdu: &'static str },

    #[snafu(display("{pdu} user information is missing the required max-length sub-item"))]
    MissingMaxLength { pdu: &'static str },

    #[snafu(display("PDV item of {length} bytes is too short to hold its own header"))]
    PdvItemTooShort { length: usize },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A cursor over a single, already fully-buffered PDU body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8]> {
        ensure!(self.remaining() >= n, UnexpectedEofSnafu { field });
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn skip(&mut self, n: usize, field: &'static str) -> Result<()> {
        self.take(n, field)?;
        Ok(())
    }

    fn str_utf8(&mut self, n: usize, field: &'static str) -> Result<String> {
        let bytes = self.take(n, field)?;
        let s = std::str::from_utf8(bytes).context(InvalidUtf8Snafu { field })?;
        Ok(s.trim_end_matches(|c: char| c == '\0' || c == ' ').to_string())
    }

    /// Reads a 2-byte-length-prefixed item header, returning `(item_type, body)`.
    fn item(&mut self, field: &'static str) -> Result<(u8, &'a [u8])> {
        let item_type = self.u8(field)?;
        self.skip(1, field)?; // reserved
        let len = self.u16(field)? as usize;
        let body = self.take(len, field)?;
        Ok((item_type, body))
    }

    fn expect_item(&mut self, expected: u8, field: &'static str) -> Result<&'a [u8]> {
        let (item_type, body) = self.item(field)?;
        ensure!(
            item_type == expected,
            UnexpectedItemTypeSnafu {
                expected,
                found: item_type
            }
        );
        Ok(body)
    }
}

/// Attempt to decode one PDU from the front of `buf`.
///
/// Returns `Ok(None)` when fewer bytes than a full PDU are currently
/// buffered; the caller should read more from the transport and retry.
/// On success, exactly the consumed PDU's bytes are removed from `buf`.
///
/// When `strict` is `true`, a PDU longer than `max_pdu_length` is a
/// decode error. When `false`, such a PDU is tolerated up to the
/// engine's absolute sanity cap ([`MAXIMUM_PDU_SIZE`]) and merely logged,
/// matching a peer that does not honor the negotiated maximum strictly.
pub fn read_pdu(buf: &mut BytesMut, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>> {
    if buf.len() < PDU_HEADER_SIZE as usize {
        return Ok(None);
    }

    let pdu_type = buf[0];
    let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);

    let max = max_pdu_length.min(MAXIMUM_PDU_SIZE);
    if strict {
        ensure!(length <= max, PduTooLargeSnafu { length, max });
    } else if length > max {
        ensure!(
            length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                length,
                max: MAXIMUM_PDU_SIZE
            }
        );
        tracing::warn!(length, max, "incoming PDU exceeds the negotiated maximum, allowing it (non-strict mode)");
    }

    let total = PDU_HEADER_SIZE as usize + length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let pdu_bytes = buf.split_to(total);
    let body = &pdu_bytes[PDU_HEADER_SIZE as usize..];
    let mut cursor = Cursor::new(body);

    let pdu = match pdu_type {
        0x01 => Pdu::AssociationRQ(read_association_rq(&mut cursor)?),
        0x02 => Pdu::AssociationAC(read_association_ac(&mut cursor)?),
        0x03 => Pdu::AssociationRJ(read_association_rj(&mut cursor)?),
        0x04 => Pdu::PData {
            data: read_pdata(&mut cursor)?,
        },
        0x05 => Pdu::ReleaseRQ,
        0x06 => Pdu::ReleaseRP,
        0x07 => Pdu::AbortRQ {
            source: read_abort_rq(&mut cursor)?,
        },
        other => Pdu::Unknown {
            pdu_type: other,
            data: body.to_vec(),
        },
    };

    Ok(Some(pdu))
}

fn read_association_rq(cursor: &mut Cursor) -> Result<AssociationRQ> {
    let protocol_version = cursor.u16("protocol_version")?;
    cursor.skip(2, "reserved")?;
    let called_ae_title = cursor.str_utf8(16, "called_ae_title")?;
    let calling_ae_title = cursor.str_utf8(16, "calling_ae_title")?;
    cursor.skip(32, "reserved")?;

    let app_context_body = cursor.expect_item(0x10, "application_context_name")?;
    let application_context_name = std::str::from_utf8(app_context_body)
        .context(InvalidUtf8Snafu {
            field: "application_context_name",
        })?
        .trim_end_matches(['\0', ' '])
        .to_string();

    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while cursor.remaining() > 0 {
        let (item_type, item_body) = cursor.item("association_rq_item")?;
        match item_type {
            0x20 => presentation_contexts.push(read_presentation_context_proposed(item_body)?),
            0x50 => user_variables = read_user_information(item_body)?,
            _ => { /* unrecognized top-level item: ignore, per forward-compat policy */ }
        }
    }

    ensure!(
        !presentation_contexts.is_empty(),
        MissingPresentationContextsSnafu { pdu: "A-ASSOCIATE-RQ" }
    );
    ensure!(
        user_variables
            .iter()
            .any(|v| matches!(v, UserVariableItem::MaxLength(_))),
        MissingMaxLengthSnafu { pdu: "A-ASSOCIATE-RQ" }
    );

    Ok(AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name,
        presentation_contexts,
        user_variables,
    })
}

fn read_association_ac(cursor: &mut Cursor) -> Result<AssociationAC> {
    let protocol_version = cursor.u16("protocol_version")?;
    cursor.skip(2, "reserved")?;
    let called_ae_title = cursor.str_utf8(16, "called_ae_title")?;
    let calling_ae_title = cursor.str_utf8(16, "calling_ae_title")?;
    cursor.skip(32, "reserved")?;

    let app_context_body = cursor.expect_item(0x10, "application_context_name")?;
    let application_context_name = std::str::from_utf8(app_context_body)
        .context(InvalidUtf8Snafu {
            field: "application_context_name",
        })?
        .trim_end_matches(['\0', ' '])
        .to_string();

    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while cursor.remaining() > 0 {
        let (item_type, item_body) = cursor.item("association_ac_item")?;
        match item_type {
            0x21 => presentation_contexts.push(read_presentation_context_result(item_body)?),
            0x50 => user_variables = read_user_information(item_body)?,
            _ => {}
        }
    }

    ensure!(
        !presentation_contexts.is_empty(),
        MissingPresentationContextsSnafu { pdu: "A-ASSOCIATE-AC" }
    );
    ensure!(
        user_variables
            .iter()
            .any(|v| matches!(v, UserVariableItem::MaxLength(_))),
        MissingMaxLengthSnafu { pdu: "A-ASSOCIATE-AC" }
    );

    Ok(AssociationAC {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name,
        presentation_contexts,
        user_variables,
    })
}

fn read_presentation_context_proposed(body: &[u8]) -> Result<PresentationContextProposed> {
    let mut cursor = Cursor::new(body);
    let id = cursor.u8("presentation_context_id")?;
    cursor.skip(3, "reserved")?;

    let mut abstract_syntax = String::new();
    let mut transfer_syntaxes = Vec::new();

    while cursor.remaining() > 0 {
        let (item_type, item_body) = cursor.item("presentation_context_sub_item")?;
        match item_type {
            0x30 => {
                abstract_syntax = std::str::from_utf8(item_body)
                    .context(InvalidUtf8Snafu {
                        field: "abstract_syntax",
                    })?
                    .trim_end_matches('\0')
                    .to_string();
            }
            0x40 => {
                let ts = std::str::from_utf8(item_body)
                    .context(InvalidUtf8Snafu {
                        field: "transfer_syntax",
                    })?
                    .trim_end_matches('\0')
                    .to_string();
                transfer_syntaxes.push(ts);
            }
            _ => {}
        }
    }

    Ok(PresentationContextProposed {
        id,
        abstract_syntax,
        transfer_syntaxes,
    })
}

fn read_presentation_context_result(body: &[u8]) -> Result<PresentationContextResult> {
    let mut cursor = Cursor::new(body);
    let id = cursor.u8("presentation_context_id")?;
    cursor.skip(1, "reserved")?;
    let reason_byte = cursor.u8("reason")?;
    cursor.skip(1, "reserved")?;
    let reason = PresentationContextResultReason::try_from(reason_byte)
        .ok()
        .context(UnknownResultReasonSnafu { value: reason_byte })?;

    let mut transfer_syntax = String::new();
    while cursor.remaining() > 0 {
        let (item_type, item_body) = cursor.item("presentation_context_result_sub_item")?;
        if item_type == 0x40 {
            transfer_syntax = std::str::from_utf8(item_body)
                .context(InvalidUtf8Snafu {
                    field: "transfer_syntax",
                })?
                .trim_end_matches('\0')
                .to_string();
        }
    }

    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax,
    })
}

fn read_user_information(body: &[u8]) -> Result<Vec<UserVariableItem>> {
    let mut cursor = Cursor::new(body);
    let mut items = Vec::new();
    while cursor.remaining() > 0 {
        let (item_type, item_body) = cursor.item("user_information_sub_item")?;
        items.push(read_user_variable_item(item_type, item_body)?);
    }
    Ok(items)
}

fn read_user_variable_item(item_type: u8, body: &[u8]) -> Result<UserVariableItem> {
    let mut cursor = Cursor::new(body);
    Ok(match item_type {
        0x51 => UserVariableItem::MaxLength(cursor.u32("max_length")?),
        0x52 => UserVariableItem::ImplementationClassUID(
            std::str::from_utf8(body)
                .context(InvalidUtf8Snafu {
                    field: "implementation_class_uid",
                })?
                .trim_end_matches('\0')
                .to_string(),
        ),
        0x53 => {
            let max_ops_invoked = cursor.u16("max_ops_invoked")?;
            let max_ops_performed = cursor.u16("max_ops_performed")?;
            UserVariableItem::AsyncOperationsWindow {
                max_ops_invoked,
                max_ops_performed,
            }
        }
        0x54 => {
            let uid_len = cursor.u16("sop_class_uid_length")? as usize;
            let sop_class_uid = cursor
                .str_utf8(uid_len, "sop_class_uid")
                .map(|s| s.trim_end_matches('\0').to_string())?;
            let scu_role_supported = cursor.u8("scu_role")? != 0;
            let scp_role_supported = cursor.u8("scp_role")? != 0;
            UserVariableItem::RoleSelection {
                sop_class_uid,
                scu_role_supported,
                scp_role_supported,
            }
        }
        0x55 => UserVariableItem::ImplementationVersionName(
            std::str::from_utf8(body)
                .context(InvalidUtf8Snafu {
                    field: "implementation_version_name",
                })?
                .trim_end_matches('\0')
                .to_string(),
        ),
        0x56 => {
            let uid_len = cursor.u16("sop_class_uid_length")? as usize;
            let uid = cursor.str_utf8(uid_len, "sop_class_uid")?;
            let app_info = cursor.take(cursor.remaining(), "service_class_app_info")?.to_vec();
            UserVariableItem::SopClassExtendedNegotiation(uid, app_info)
        }
        0x58 => {
            let identity_type_byte = cursor.u8("user_identity_type")?;
            let identity_type = UserIdentityType::from_u8(identity_type_byte)
                .context(UnknownUserIdentityTypeSnafu {
                    value: identity_type_byte,
                })?;
            let positive_response_requested = cursor.u8("positive_response_requested")? != 0;
            let primary_len = cursor.u16("primary_field_length")? as usize;
            let primary_field = cursor.take(primary_len, "primary_field")?.to_vec();
            let secondary_field = if cursor.remaining() >= 2 {
                let secondary_len = cursor.u16("secondary_field_length")? as usize;
                cursor.take(secondary_len, "secondary_field")?.to_vec()
            } else {
                Vec::new()
            };
            UserVariableItem::UserIdentity(UserIdentity::new(
                positive_response_requested,
                identity_type,
                primary_field,
                secondary_field,
            ))
        }
        other => UserVariableItem::Unknown(other, body.to_vec()),
    })
}

fn read_association_rj(cursor: &mut Cursor) -> Result<AssociationRJ> {
    cursor.skip(1, "reserved")?;
    let result_byte = cursor.u8("result")?;
    let result = if result_byte == 1 {
        AssociationRJResult::Permanent
    } else {
        AssociationRJResult::Transient
    };
    let source_byte = cursor.u8("source")?;
    let reason_byte = cursor.u8("reason")?;
    let source = match source_byte {
        1 => AssociationRJSource::ServiceUser(match reason_byte {
            1 => AssociationRJServiceUserReason::NoReasonGiven,
            2 => AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            3 => AssociationRJServiceUserReason::CallingAeTitleNotRecognized,
            7 => AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
            _ => AssociationRJServiceUserReason::NoReasonGiven,
        }),
        2 => AssociationRJSource::ServiceProviderAcse(match reason_byte {
            2 => AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            _ => AssociationRJServiceProviderAcseReason::NoReasonGiven,
        }),
        3 => AssociationRJSource::ServiceProviderPresentation(match reason_byte {
            2 => AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            _ => AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
        }),
        other => return UnknownRejectSourceSnafu { value: other }.fail(),
    };
    Ok(AssociationRJ { result, source })
}

fn read_abort_rq(cursor: &mut Cursor) -> Result<AbortRQSource> {
    cursor.skip(2, "reserved")?;
    let source_byte = cursor.u8("source")?;
    let reason_byte = cursor.u8("reason")?;
    Ok(if source_byte == 2 {
        AbortRQSource::ServiceProvider(match reason_byte {
            1 => AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
            2 => AbortRQServiceProviderReason::UnexpectedPdu,
            4 => AbortRQServiceProviderReason::UnrecognizedPduParameter,
            5 => AbortRQServiceProviderReason::UnexpectedPduParameter,
            6 => AbortRQServiceProviderReason::InvalidPduParameter,
            _ => AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
        })
    } else {
        AbortRQSource::ServiceUser
    })
}

fn read_pdata(cursor: &mut Cursor) -> Result<Vec<PDataValue>> {
    let mut values = Vec::new();
    while cursor.remaining() > 0 {
        let item_len = cursor.u32("pdata_item_length")? as usize;
        let presentation_context_id = cursor.u8("presentation_context_id")?;
        let control_header = cursor.u8("message_control_header")?;
        ensure!(
            control_header & !0x03 == 0,
            ReservedControlBitsSnafu { value: control_header }
        );
        ensure!(item_len >= 2, PdvItemTooShortSnafu { length: item_len });
        let data_len = item_len - 2;
        let data = cursor.take(data_len, "pdv_data")?.to_vec();
        values.push(PDataValue {
            presentation_context_id,
            value_type: if control_header & 0x01 != 0 {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            },
            is_last: control_header & 0x02 != 0,
            data,
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_none_on_partial_header() {
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00][..]);
        assert_eq!(read_pdu(&mut buf, 16_384, true).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn returns_none_on_partial_body() {
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00][..]);
        assert_eq!(read_pdu(&mut buf, 16_384, true).unwrap(), None);
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn rejects_oversized_pdu() {
        let mut buf = BytesMut::from(&[0x04, 0x00, 0x00, 0x02, 0x00, 0x00][..]);
        let err = read_pdu(&mut buf, 16_384, true).unwrap_err();
        assert!(matches!(err, Error::PduTooLarge { .. }));
    }

    #[test]
    fn unknown_pdu_type_is_preserved() {
        let mut buf = BytesMut::from(&[0xFF, 0x00, 0x00, 0x00, 0x00, 0x02, 0xAB, 0xCD][..]);
        let pdu = read_pdu(&mut buf, 16_384, true).unwrap().unwrap();
        assert_eq!(
            pdu,
            Pdu::Unknown {
                pdu_type: 0xFF,
                data: vec![0xAB, 0xCD],
            }
        );
    }

    #[test]
    fn pdv_with_reserved_control_bits_is_rejected() {
        use super::super::writer::write_pdu;
        use super::super::{PDataValue, PDataValueType, Pdu};

        let mut buf = BytesMut::new();
        write_pdu(
            &mut buf,
            &Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![1, 2, 3],
                }],
            },
        )
        .unwrap();
        // the message control header byte sits right after the 4-byte
        // item length and 1-byte presentation context id, 6 bytes into
        // the 6-byte PDU header's body.
        let control_header_offset = PDU_HEADER_SIZE as usize + 4 + 1;
        buf[control_header_offset] |= 0x04; // set a reserved bit

        let err = read_pdu(&mut buf, 16_384, true).unwrap_err();
        assert!(matches!(err, Error::ReservedControlBits { value } if value & 0x04 != 0));
    }

    #[test]
    fn assoc_rq_without_any_presentation_context_is_rejected() {
        use super::super::writer::write_pdu;
        use super::super::{AssociationRQ, Pdu, UserVariableItem};

        let rq = AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![UserVariableItem::MaxLength(16_384)],
        };
        let mut buf = BytesMut::new();
        write_pdu(&mut buf, &Pdu::AssociationRQ(rq)).unwrap();

        let err = read_pdu(&mut buf, 16_384, true).unwrap_err();
        assert!(matches!(err, Error::MissingPresentationContexts { .. }));
    }

    #[test]
    fn assoc_rq_without_max_length_is_rejected() {
        use super::super::writer::write_pdu;
        use super::super::{AssociationRQ, Pdu, PresentationContextProposed};

        let rq = AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![],
        };
        let mut buf = BytesMut::new();
        write_pdu(&mut buf, &Pdu::AssociationRQ(rq)).unwrap();

        let err = read_pdu(&mut buf, 16_384, true).unwrap_err();
        assert!(matches!(err, Error::MissingMaxLength { .. }));
    }
}
