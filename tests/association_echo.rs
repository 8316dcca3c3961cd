//! End-to-end C-ECHO exchange over an in-process association: the
//! requestor sends a verification request and awaits the acceptor's
//! synthesized response, then releases.

use std::future::Future;
use std::sync::Arc;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use dicom_ul_engine::dimse::{CommandField, DicomMessage, Status};
use dicom_ul_engine::options::{AcceptAny, KnownAbstractSyntaxes, ServiceOptions};
use dicom_ul_engine::pdu::PresentationContextProposed;
use dicom_ul_engine::roles::ServiceHandlers;
use dicom_ul_engine::service::{AssociationRequest, ServiceEngine};
use dicom_ul_engine::sink::TempFileSink;
use dicom_ul_engine::transcode::RegistryTranscoder;

const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
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
        dicom_value!(Str, VERIFICATION_SOP_CLASS),
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
    command.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [0x0101]),
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
async fn c_echo_round_trip() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    let server_options = ServiceOptions::new().ae_title("ECHO-SCP");
    let (server_engine, _server_handle) = ServiceEngine::new_server(
        server_stream,
        server_options,
        Arc::new(AcceptAny),
        Arc::new(KnownAbstractSyntaxes {
            abstract_syntaxes: vec![VERIFICATION_SOP_CLASS.to_string()],
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            promiscuous: false,
        }),
        Arc::new(RegistryTranscoder),
        TempFileSink::new(),
        EchoHandlers,
    );

    let client_options = ServiceOptions::new().ae_title("ECHO-SCU");
    let request = AssociationRequest {
        calling_ae_title: "ECHO-SCU".to_string(),
        called_ae_title: "ECHO-SCP".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
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

    while client_handle.association().await.is_none() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let mut rx = client_handle
        .send_request(c_echo_request(1))
        .await
        .expect("failed to send C-ECHO-RQ");
    let response = rx.recv().await.expect("no response received");

    assert_eq!(response.command_field, CommandField::CEchoRsp);
    assert_eq!(response.status(), Some(Status::SUCCESS));
    assert_eq!(response.request_message_id(), Some(1));

    client_handle
        .request_release()
        .await
        .expect("failed to request release");

    client_task.await.expect("client task panicked").unwrap();
    server_task.await.expect("server task panicked").unwrap();
}
