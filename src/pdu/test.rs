//! Round-trip tests across the full PDU variant set (spec §8 invariant 8:
//! `decode(encode(P)) == P`), in the manner of `dicom_ul::pdu::test`.

use bytes::BytesMut;

use super::reader::read_pdu;
use super::writer::write_pdu;
use super::*;

fn roundtrip(pdu: Pdu) -> Pdu {
    let mut buf = BytesMut::new();
    write_pdu(&mut buf, &pdu).unwrap();
    let decoded = read_pdu(&mut buf, MAXIMUM_PDU_SIZE, true).unwrap().unwrap();
    assert!(buf.is_empty(), "reader left unconsumed bytes");
    decoded
}

#[test]
fn roundtrip_association_rq_full_user_info() {
    let rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "CALLING-AE".to_string(),
        called_ae_title: "CALLED-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.3.4.5".to_string()),
            UserVariableItem::ImplementationVersionName("TESTENGINE_001".to_string()),
            UserVariableItem::AsyncOperationsWindow {
                max_ops_invoked: 5,
                max_ops_performed: 1,
            },
            UserVariableItem::RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                scu_role_supported: true,
                scp_role_supported: false,
            },
            UserVariableItem::UserIdentity(UserIdentity::new(
                true,
                UserIdentityType::UsernamePasscode,
                b"alice".to_vec(),
                b"s3cr3t".to_vec(),
            )),
        ],
    };

    let decoded = roundtrip(Pdu::AssociationRQ(rq.clone()));
    assert_eq!(decoded, Pdu::AssociationRQ(rq));
}

#[test]
fn roundtrip_association_ac() {
    let ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "CALLING-AE".to_string(),
        called_ae_title: "CALLED-AE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextResult {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.3.4.5".to_string()),
        ],
    };

    let decoded = roundtrip(Pdu::AssociationAC(ac.clone()));
    assert_eq!(decoded, Pdu::AssociationAC(ac));
}

#[test]
fn roundtrip_association_rj() {
    let rj = AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
        ),
    };
    let decoded = roundtrip(Pdu::AssociationRJ(rj));
    assert_eq!(decoded, Pdu::AssociationRJ(rj));
}

#[test]
fn roundtrip_pdata_multi_pdv() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0; 128],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0xFF; 32],
            },
        ],
    };
    let decoded = roundtrip(pdu.clone());
    assert_eq!(decoded, pdu);
}

#[test]
fn roundtrip_release_rq_and_rp() {
    assert_eq!(roundtrip(Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(roundtrip(Pdu::ReleaseRP), Pdu::ReleaseRP);
}

#[test]
fn roundtrip_abort_both_sources() {
    let from_user = Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    };
    assert_eq!(roundtrip(from_user.clone()), from_user);

    let from_provider = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter),
    };
    assert_eq!(roundtrip(from_provider.clone()), from_provider);
}

#[test]
fn unrecognized_pdu_type_0xff_is_preserved_verbatim() {
    let pdu = Pdu::Unknown {
        pdu_type: 0xFF,
        data: vec![1, 2, 3],
    };
    let decoded = roundtrip(pdu.clone());
    assert_eq!(decoded, pdu);
}

#[test]
fn ae_titles_are_space_padded_on_the_wire_and_trimmed_on_decode() {
    let rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SHORT".to_string(),
        called_ae_title: "ALSO-SHORT".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::MaxLength(16_384)],
    };

    let mut buf = BytesMut::new();
    write_pdu(&mut buf, &Pdu::AssociationRQ(rq.clone())).unwrap();

    // called/calling AE titles are the two 16-byte fields starting right
    // after the 4-byte protocol-version/reserved header of the RQ body.
    let body = &buf[PDU_HEADER_SIZE as usize..];
    assert_eq!(&body[4..14], b"ALSO-SHORT");
    assert_eq!(&body[14..20], b"      ");
    assert_eq!(&body[20..25], b"SHORT");
    assert_eq!(&body[25..36], b"           ");

    let decoded = roundtrip(Pdu::AssociationRQ(rq.clone()));
    assert_eq!(decoded, Pdu::AssociationRQ(rq));
}
