//! End-to-end C-STORE exchange over an in-process association: the
//! requestor sends an instance with a data set, the acceptor spills the
//! reassembled data set to the configured [`TempFileSink`] and hands
//! the parsed object back to its `on_c_store_request` upcall.

use std::future::Future;
use std::sync::{Arc, Mutex};

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

const SC_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
const SOP_INSTANCE_UID: &str = "1.2.3.4.5.6.7.8.9";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

struct StoreHandlers {
    received: Arc<Mutex<Option<InMemDicomObject>>>,
}

impl ServiceHandlers for StoreHandlers {
    fn on_c_store_request(
        &self,
        request: &DicomMessage,
    ) -> impl Future<Output = Option<Status>> + Send {
        async move {
            *self.received.lock().unwrap() = request.dataset.clone();
            Some(Status::SUCCESS)
        }
    }
}

fn c_store_request(message_id: u16) -> DicomMessage {
    let mut command = InMemDicomObject::new_empty();
    command.put(DataElement::new(
        tags::AFFECTED_SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, SC_IMAGE_STORAGE),
    ));
    command.put(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [CommandField::CStoreRq as u16]),
    ));
    command.put(DataElement::new(
        tags::MESSAGE_ID,
        VR::US,
        dicom_value!(U16, [message_id]),
    ));
    command.put(DataElement::new(
        tags::AFFECTED_SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, SOP_INSTANCE_UID),
    ));
    command.put(DataElement::new(
        tags::PRIORITY,
        VR::US,
        dicom_value!(U16, [0x0000]),
    ));

    let mut dataset = InMemDicomObject::new_empty();
    dataset.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, "Doe^Jane"),
    ));
    dataset.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, SOP_INSTANCE_UID),
    ));

    DicomMessage {
        command,
        dataset: Some(dataset),
        presentation_context_id: 1,
        command_field: CommandField::CStoreRq,
        dataset_transfer_syntax: Some(IMPLICIT_VR_LE.to_string()),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn c_store_round_trip_spills_dataset_to_sink() {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);

    let received = Arc::new(Mutex::new(None));
    let server_options = ServiceOptions::new().ae_title("STORE-SCP");
    let (server_engine, _server_handle) = ServiceEngine::new_server(
        server_stream,
        server_options,
        Arc::new(AcceptAny),
        Arc::new(KnownAbstractSyntaxes {
            abstract_syntaxes: vec![SC_IMAGE_STORAGE.to_string()],
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            promiscuous: false,
        }),
        Arc::new(RegistryTranscoder),
        TempFileSink::new(),
        StoreHandlers {
            received: received.clone(),
        },
    );

    let client_options = ServiceOptions::new().ae_title("STORE-SCU");
    let request = AssociationRequest {
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: SC_IMAGE_STORAGE.to_string(),
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
        .send_request(c_store_request(1))
        .await
        .expect("failed to send C-STORE-RQ");
    let response = rx.recv().await.expect("no response received");

    assert_eq!(response.command_field, CommandField::CStoreRsp);
    assert_eq!(response.status(), Some(Status::SUCCESS));

    let stored = received.lock().unwrap().take().expect("no dataset delivered to the handler");
    assert_eq!(
        stored.element_by_name("PatientName").unwrap().to_str().unwrap(),
        "Doe^Jane"
    );

    client_handle
        .request_release()
        .await
        .expect("failed to request release");

    client_task.await.expect("client task panicked").unwrap();
    server_task.await.expect("server task panicked").unwrap();
}
