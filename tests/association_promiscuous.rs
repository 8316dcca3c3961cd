//! Promiscuous abstract-syntax acceptance: a server configured with
//! `KnownAbstractSyntaxes { promiscuous: true, .. }` accepts a
//! presentation context for an abstract syntax it does not have
//! explicitly configured, per spec §4.2's "promiscuous mode" policy.

use std::future::Future;
use std::sync::Arc;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use dicom_ul_engine::assoc::PresentationContext;
use dicom_ul_engine::dimse::{CommandField, DicomMessage, Status};
use dicom_ul_engine::options::{AcceptAny, KnownAbstractSyntaxes, ServiceOptions};
use dicom_ul_engine::pdu::{PresentationContextProposed, PresentationContextResultReason};
use dicom_ul_engine::roles::ServiceHandlers;
use dicom_ul_engine::service::{AssociationRequest, ServiceEngine};
use dicom_ul_engine::sink::TempFileSink;
use dicom_ul_engine::transcode::RegistryTranscoder;

// An abstract syntax the server's `KnownAbstractSyntaxes` list below does
// not name; only promiscuous mode lets this presentation context through.
const UNLISTED_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.128";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

struct EchoHandlers;

impl ServiceHandlers for EchoHandlers {
    fn on_c_echo_request(
        &self,
        _request: &DicomMessage,
    ) -> impl Future<Output = Option<Status>> + Send {
        async { Some(Status::SUCCESS) }
    }
}

fn c_echo_request(message_id: u16) -> DicomMessage {
    let mut command = InMemDicomObject::new_empty();
    command.put(DataElement::new(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, UNLISTED_STORAGE_SOP_CLASS),
    ));
    command.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [CommandField::CEchoRq as u16]),
    ));
    command.put(DataElement::new(
        tags::MESSAGE_ID,
        VR::US,
        dicom_value!(U16, [message_id]),
    ));

    DicomMessage {
        command,
        dataset: None,
        presentation_context_id: 1,
        command_field: CommandField::CEchoRq,
        dataset_transfer_syntax: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn promiscuous_server_accepts_unlisted_abstract_syntax() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    // Deliberately empty: the server knows nothing about
    // `UNLISTED_STORAGE_SOP_CLASS` ahead of time.
    let server_options = ServiceOptions::new().ae_title("PROMISC-SCP");
    let (server_engine, _server_handle) = ServiceEngine::new_server(
        server_stream,
        server_options,
        Arc::new(AcceptAny),
        Arc::new(KnownAbstractSyntaxes {
            abstract_syntaxes: vec![],
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            promiscuous: true,
        }),
        Arc::new(RegistryTranscoder),
        TempFileSink::new(),
        EchoHandlers,
    );

    let client_options = ServiceOptions::new().ae_title("PROMISC-SCU");
    let request = AssociationRequest {
        calling_ae_title: "PROMISC-SCU".to_string(),
        called_ae_title: "PROMISC-SCP".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: UNLISTED_STORAGE_SOP_CLASS.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
        }],
        user_identity: None,
        role_selections: vec![],
    };
    let (client_engine, client_handle) = ServiceEngine::new_client(
        client_stream,
        client_options,
        request,
        Arc::new(RegistryTranscoder),
        TempFileSink::new(),
        (),
    );

    let server_task = tokio::spawn(server_engine.run());
    let client_task = tokio::spawn(client_engine.run());

    let association = loop {
        if let Some(association) = client_handle.association().await {
            break association;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    };

    let pc: &PresentationContext = association
        .context(1)
        .expect("presentation context 1 negotiated");
    assert_eq!(pc.result, PresentationContextResultReason::Acceptance);
    assert_eq!(pc.abstract_syntax, UNLISTED_STORAGE_SOP_CLASS);

    let mut rx = client_handle
        .send_request(c_echo_request(1))
        .await
        .expect("failed to send C-ECHO-RQ");
    let response = rx.recv().await.expect("no response received");
    assert_eq!(response.status(), Some(Status::SUCCESS));

    client_handle
        .request_release()
        .await
        .expect("failed to request release");

    client_task.await.expect("client task panicked").unwrap();
    server_task.await.expect("server task panicked").unwrap();
}
