//! Encoding of upper layer PDUs into their wire representation.
//!
//! Encoding is pure and synchronous: it appends bytes to a [`BytesMut`]
//! buffer and never touches a byte stream directly. The caller (the
//! service engine's writer task) is responsible for flushing the buffer
//! to the transport.

use bytes::{BufMut, BytesMut};
use snafu::Snafu;

use super::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJSource,
    AssociationRQ, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, UserIdentity, UserVariableItem, MAXIMUM_PDU_SIZE,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("PDU of {length} bytes exceeds the maximum of {max}"))]
    PduTooLarge { length: usize, max: usize },

    #[snafu(display("field `{field}` is too long to encode ({length} bytes)"))]
    FieldTooLong { field: &'static str, length: usize },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Serialize a PDU to the end of `buf`.
pub fn write_pdu(buf: &mut BytesMut, pdu: &Pdu) -> Result<()> {
    // Reserve the 6-byte header, fill in the length once the body is known.
    let header_at = buf.len();
    buf.put_u8(pdu.pdu_type());
    buf.put_u8(0); // reserved
    buf.put_u32(0); // placeholder length

    let body_at = buf.len();
    match pdu {
        Pdu::AssociationRQ(rq) => write_association_rq(buf, rq)?,
        Pdu::AssociationAC(ac) => write_association_ac(buf, ac)?,
        Pdu::AssociationRJ(rj) => write_association_rj(buf, rj),
        Pdu::PData { data } => write_pdata(buf, data)?,
        Pdu::ReleaseRQ => buf.put_u32(0),
        Pdu::ReleaseRP => buf.put_u32(0),
        Pdu::AbortRQ { source } => write_abort_rq(buf, *source),
        Pdu::Unknown { data, .. } => buf.put_slice(data),
    }

    let body_len = buf.len() - body_at;
    if body_len > MAXIMUM_PDU_SIZE as usize {
        buf.truncate(header_at);
        return PduTooLargeSnafu {
            length: body_len,
            max: MAXIMUM_PDU_SIZE as usize,
        }
        .fail();
    }
    let length_bytes = (body_len as u32).to_be_bytes();
    buf[header_at + 2..header_at + 6].copy_from_slice(&length_bytes);
    Ok(())
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<()> {
    if len > max {
        FieldTooLongSnafu { field, length: len }.fail()
    } else {
        Ok(())
    }
}

fn write_padded_ae_title(buf: &mut BytesMut, ae_title: &str) -> Result<()> {
    check_len("ae_title", ae_title.len(), 16)?;
    let mut padded = [b' '; 16];
    padded[..ae_title.len()].copy_from_slice(ae_title.as_bytes());
    buf.put_slice(&padded);
    Ok(())
}

fn write_item(buf: &mut BytesMut, item_type: u8, body: impl FnOnce(&mut BytesMut)) {
    let header_at = buf.len();
    buf.put_u8(item_type);
    buf.put_u8(0); // reserved
    buf.put_u16(0); // placeholder length
    let body_at = buf.len();
    body(buf);
    let len = (buf.len() - body_at) as u16;
    buf[header_at + 2..header_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn write_association_rq(buf: &mut BytesMut, rq: &AssociationRQ) -> Result<()> {
    buf.put_u16(rq.protocol_version);
    buf.put_u16(0); // reserved
    write_padded_ae_title(buf, &rq.called_ae_title)?;
    write_padded_ae_title(buf, &rq.calling_ae_title)?;
    buf.put_bytes(0, 32); // reserved

    write_item(buf, 0x10, |buf| {
        buf.put_slice(rq.application_context_name.as_bytes())
    });

    for pc in &rq.presentation_contexts {
        write_presentation_context_proposed(buf, pc);
    }

    write_user_information(buf, &rq.user_variables);
    Ok(())
}

fn write_association_ac(buf: &mut BytesMut, ac: &AssociationAC) -> Result<()> {
    buf.put_u16(ac.protocol_version);
    buf.put_u16(0); // reserved
    // PS3.8 10.3.2: these 32-byte fields shall be sent back to the requestor
    // unchanged, but receivers shall not interpret them.
    write_padded_ae_title(buf, &ac.called_ae_title)?;
    write_padded_ae_title(buf, &ac.calling_ae_title)?;
    buf.put_bytes(0, 32); // reserved

    write_item(buf, 0x10, |buf| {
        buf.put_slice(ac.application_context_name.as_bytes())
    });

    for pc in &ac.presentation_contexts {
        write_presentation_context_result(buf, pc);
    }

    write_user_information(buf, &ac.user_variables);
    Ok(())
}

fn write_presentation_context_proposed(buf: &mut BytesMut, pc: &PresentationContextProposed) {
    write_item(buf, 0x20, |buf| {
        buf.put_u8(pc.id);
        buf.put_bytes(0, 3); // reserved
        write_item(buf, 0x30, |buf| buf.put_slice(pc.abstract_syntax.as_bytes()));
        for ts in &pc.transfer_syntaxes {
            write_item(buf, 0x40, |buf| buf.put_slice(ts.as_bytes()));
        }
    });
}

fn write_presentation_context_result(buf: &mut BytesMut, pc: &PresentationContextResult) {
    write_item(buf, 0x21, |buf| {
        buf.put_u8(pc.id);
        buf.put_u8(0); // reserved
        buf.put_u8(pc.reason as u8);
        buf.put_u8(0); // reserved
        write_item(buf, 0x40, |buf| buf.put_slice(pc.transfer_syntax.as_bytes()));
    });
}

fn write_user_information(buf: &mut BytesMut, items: &[UserVariableItem]) {
    write_item(buf, 0x50, |buf| {
        for item in items {
            write_user_variable_item(buf, item);
        }
    });
}

fn write_user_variable_item(buf: &mut BytesMut, item: &UserVariableItem) {
    match item {
        UserVariableItem::MaxLength(len) => {
            write_item(buf, 0x51, |buf| buf.put_u32(*len));
        }
        UserVariableItem::ImplementationClassUID(uid) => {
            write_item(buf, 0x52, |buf| buf.put_slice(uid.as_bytes()));
        }
        UserVariableItem::AsyncOperationsWindow {
            max_ops_invoked,
            max_ops_performed,
        } => {
            write_item(buf, 0x53, |buf| {
                buf.put_u16(*max_ops_invoked);
                buf.put_u16(*max_ops_performed);
            });
        }
        UserVariableItem::RoleSelection {
            sop_class_uid,
            scu_role_supported,
            scp_role_supported,
        } => {
            write_item(buf, 0x54, |buf| {
                buf.put_u16(sop_class_uid.len() as u16);
                buf.put_slice(sop_class_uid.as_bytes());
                buf.put_u8(*scu_role_supported as u8);
                buf.put_u8(*scp_role_supported as u8);
            });
        }
        UserVariableItem::ImplementationVersionName(name) => {
            write_item(buf, 0x55, |buf| buf.put_slice(name.as_bytes()));
        }
        UserVariableItem::SopClassExtendedNegotiation(uid, app_info) => {
            write_item(buf, 0x56, |buf| {
                buf.put_u16(uid.len() as u16);
                buf.put_slice(uid.as_bytes());
                buf.put_slice(app_info);
            });
        }
        UserVariableItem::UserIdentity(identity) => write_user_identity(buf, identity),
        UserVariableItem::Unknown(item_type, data) => {
            write_item(buf, *item_type, |buf| buf.put_slice(data));
        }
    }
}

fn write_user_identity(buf: &mut BytesMut, identity: &UserIdentity) {
    write_item(buf, 0x58, |buf| {
        buf.put_u8(identity.identity_type as u8);
        buf.put_u8(identity.positive_response_requested as u8);
        buf.put_u16(identity.primary_field.len() as u16);
        buf.put_slice(&identity.primary_field);
        buf.put_u16(identity.secondary_field.len() as u16);
        buf.put_slice(&identity.secondary_field);
    });
}

fn write_association_rj(buf: &mut BytesMut, rj: AssociationRJ) {
    buf.put_u8(0); // reserved
    buf.put_u8(rj.result as u8);
    let (source, reason) = match rj.source {
        AssociationRJSource::ServiceUser(r) => (1u8, r as u8),
        AssociationRJSource::ServiceProviderAcse(r) => (2u8, r as u8),
        AssociationRJSource::ServiceProviderPresentation(r) => (3u8, r as u8),
    };
    buf.put_u8(source);
    buf.put_u8(reason);
}

fn write_abort_rq(buf: &mut BytesMut, source: AbortRQSource) {
    buf.put_u8(0); // reserved
    buf.put_u8(0); // reserved
    match source {
        AbortRQSource::ServiceUser => {
            buf.put_u8(0);
            buf.put_u8(0);
        }
        AbortRQSource::ServiceProvider(reason) => {
            buf.put_u8(2);
            buf.put_u8(reason as u8);
        }
    }
}

fn write_pdata(buf: &mut BytesMut, values: &[PDataValue]) -> Result<()> {
    for value in values {
        let header_at = buf.len();
        buf.put_u32(0); // placeholder item length
        let body_at = buf.len();
        buf.put_u8(value.presentation_context_id);
        let mut control_header = 0u8;
        if matches!(value.value_type, PDataValueType::Command) {
            control_header |= 0x01;
        }
        if value.is_last {
            control_header |= 0x02;
        }
        buf.put_u8(control_header);
        buf.put_slice(&value.data);
        let len = (buf.len() - body_at) as u32;
        buf[header_at..header_at + 4].copy_from_slice(&len.to_be_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::read_pdu;

    #[test]
    fn roundtrip_release_rq() {
        let mut buf = BytesMut::new();
        write_pdu(&mut buf, &Pdu::ReleaseRQ).unwrap();
        assert_eq!(
            &buf[..],
            &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]
        );

        let pdu = read_pdu(&mut buf, 16_384, true).unwrap().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_abort_rq() {
        let mut buf = BytesMut::new();
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            ),
        };
        write_pdu(&mut buf, &pdu).unwrap();
        let decoded = read_pdu(&mut buf, 16_384, true).unwrap().unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn roundtrip_pdata() {
        let mut buf = BytesMut::new();
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![1, 2, 3, 4],
            }],
        };
        write_pdu(&mut buf, &pdu).unwrap();
        let decoded = read_pdu(&mut buf, 16_384, true).unwrap().unwrap();
        assert_eq!(decoded, pdu);
    }
}
