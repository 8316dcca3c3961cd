//! The receive reassembler (spec §4.4, component C4): consumes PDVs in
//! arrival order, reassembling the command and (optional) data set
//! fragments of one DIMSE message per presentation context, selecting
//! a receive sink (in-memory, or spillover for C-STORE) along the way.

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::assoc::Association;
use crate::dimse::{self, CommandField, DicomMessage};
use crate::pdu::{PDataValue, PDataValueType};
use crate::sink::{CStoreContext, CStoreSink, CStoreSinkProvider, SinkError};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("no presentation context {id} negotiated for this association"))]
    UnknownPresentationContext { id: u8 },

    #[snafu(display("failed to decode command set"))]
    DecodeCommand { source: dimse::Error },

    #[snafu(display("failed to decode data set"))]
    DecodeDataset { source: dicom_object::ReadError },

    #[snafu(display("failed to open receive sink"))]
    OpenSink { source: SinkError },

    #[snafu(display("failed to write to receive sink"))]
    WriteSink { source: SinkError },

    #[snafu(display("command set is missing required element `{name}`"))]
    MissingElement { name: &'static str },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What processing one PDV produced.
pub enum ReassembleOutcome {
    /// More fragments are expected before a message is complete.
    Continue,
    /// A complete DIMSE message was reassembled and is ready for
    /// dispatch.
    Delivered(DicomMessage),
    /// A C-STORE request's data set could not be decoded after
    /// reassembly. The engine should send this `ProcessingFailure`
    /// response without aborting the association (spec §4.4, §7), and
    /// may forward the carried reason to a role-level exception upcall.
    CStoreDecodeFailed(DicomMessage, String),
}

enum ReceiveSink {
    Memory(Vec<u8>),
    CStore(CStoreSink),
}

impl ReceiveSink {
    async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            ReceiveSink::Memory(buf) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            ReceiveSink::CStore(sink) => sink.write_all(bytes).await.context(WriteSinkSnafu),
        }
    }
}

struct PendingCommand {
    command: InMemDicomObject,
    command_field: CommandField,
    presentation_context_id: u8,
}

/// Per-connection reassembly state. One instance is owned by the
/// reader task for the lifetime of the association.
pub struct Reassembler<P> {
    sink_provider: P,
    this_ae_title: String,
    buffer: Option<ReceiveSink>,
    pending: Option<PendingCommand>,
}

impl<P: CStoreSinkProvider> Reassembler<P> {
    pub fn new(sink_provider: P, this_ae_title: impl Into<String>) -> Self {
        Reassembler {
            sink_provider,
            this_ae_title: this_ae_title.into(),
            buffer: None,
            pending: None,
        }
    }

    /// Feed one PDV into the reassembler (spec §4.4).
    ///
    /// Per the ordering invariant, PDVs for one message on one
    /// presentation context id arrive contiguously; this is not
    /// re-checked here, only relied upon.
    pub async fn process_pdv(
        &mut self,
        pdv: PDataValue,
        association: &Association,
    ) -> Result<ReassembleOutcome> {
        if self.buffer.is_none() {
            self.buffer = Some(match &self.pending {
                None => ReceiveSink::Memory(Vec::new()),
                Some(pending) => self.open_data_sink(pending, association).await?,
            });
        }

        self.buffer
            .as_mut()
            .expect("sink just ensured present")
            .append(&pdv.data)
            .await?;

        if !pdv.is_last {
            return Ok(ReassembleOutcome::Continue);
        }

        match self.pending.take() {
            None => self.finish_command(pdv.presentation_context_id).await,
            Some(pending) => self.finish_dataset(pending, association).await,
        }
    }

    async fn open_data_sink(
        &self,
        pending: &PendingCommand,
        association: &Association,
    ) -> Result<ReceiveSink> {
        if pending.command_field != CommandField::CStoreRq {
            return Ok(ReceiveSink::Memory(Vec::new()));
        }

        let pc = association
            .context(pending.presentation_context_id)
            .context(UnknownPresentationContextSnafu {
                id: pending.presentation_context_id,
            })?;
        let sop_instance_uid = element_str(&pending.command, tags::AFFECTED_SOP_INSTANCE_UID)
            .context(MissingElementSnafu {
                name: "AffectedSOPInstanceUID",
            })?;
        let transfer_syntax = pc.accepted_transfer_syntax.as_deref().unwrap_or_default();

        let ctx = CStoreContext {
            sop_class_uid: &pc.abstract_syntax,
            sop_instance_uid: &sop_instance_uid,
            transfer_syntax,
            calling_ae_title: &association.calling_ae_title,
            remote_implementation_class_uid: association.remote_implementation_class_uid.as_deref(),
            remote_implementation_version_name: association
                .remote_implementation_version_name
                .as_deref(),
        };
        let sink = self.sink_provider.create_sink(&ctx).await.context(OpenSinkSnafu)?;
        Ok(ReceiveSink::CStore(sink))
    }

    async fn finish_command(&mut self, presentation_context_id: u8) -> Result<ReassembleOutcome> {
        let buf = match self.buffer.take() {
            Some(ReceiveSink::Memory(buf)) => buf,
            _ => unreachable!("command stream is always an in-memory sink"),
        };

        let (command_field, command) = dimse::decode_command(&buf).context(DecodeCommandSnafu)?;

        if !dimse::command_has_dataset(&command) {
            let message = DicomMessage {
                command,
                dataset: None,
                presentation_context_id,
                command_field,
                dataset_transfer_syntax: None,
            };
            return Ok(ReassembleOutcome::Delivered(message));
        }

        self.pending = Some(PendingCommand {
            command,
            command_field,
            presentation_context_id,
        });
        Ok(ReassembleOutcome::Continue)
    }

    async fn finish_dataset(
        &mut self,
        pending: PendingCommand,
        association: &Association,
    ) -> Result<ReassembleOutcome> {
        let sink = self.buffer.take().expect("data sink just appended to");
        let pc = association
            .context(pending.presentation_context_id)
            .context(UnknownPresentationContextSnafu {
                id: pending.presentation_context_id,
            })?;
        let transfer_syntax = pc.accepted_transfer_syntax.clone().unwrap_or_default();

        if pending.command_field == CommandField::CStoreRq {
            let sink = match sink {
                ReceiveSink::CStore(s) => s,
                ReceiveSink::Memory(_) => unreachable!("C-STORE data sink is always spillover"),
            };

            let sop_instance_uid =
                element_str(&pending.command, tags::AFFECTED_SOP_INSTANCE_UID).unwrap_or_default();
            let ctx = CStoreContext {
                sop_class_uid: &pc.abstract_syntax,
                sop_instance_uid: &sop_instance_uid,
                transfer_syntax: &transfer_syntax,
                calling_ae_title: &association.calling_ae_title,
                remote_implementation_class_uid: association
                    .remote_implementation_class_uid
                    .as_deref(),
                remote_implementation_version_name: association
                    .remote_implementation_version_name
                    .as_deref(),
            };

            match self.sink_provider.finalize(sink, &ctx).await {
                Ok(Some(file)) => {
                    let request = DicomMessage {
                        command: pending.command,
                        dataset: Some(file.into_inner()),
                        presentation_context_id: pending.presentation_context_id,
                        command_field: pending.command_field,
                        dataset_transfer_syntax: Some(transfer_syntax),
                    };
                    Ok(ReassembleOutcome::Delivered(request))
                }
                Ok(None) => {
                    let request = DicomMessage {
                        command: pending.command,
                        dataset: None,
                        presentation_context_id: pending.presentation_context_id,
                        command_field: pending.command_field,
                        dataset_transfer_syntax: Some(transfer_syntax),
                    };
                    Ok(ReassembleOutcome::Delivered(request))
                }
                Err(err) => {
                    let reason = err.to_string();
                    let request_stub = DicomMessage {
                        command: pending.command,
                        dataset: None,
                        presentation_context_id: pending.presentation_context_id,
                        command_field: pending.command_field,
                        dataset_transfer_syntax: None,
                    };
                    self.sink_provider.exception(None, &err);
                    let response = DicomMessage::c_store_processing_failure_response(&request_stub);
                    Ok(ReassembleOutcome::CStoreDecodeFailed(response, reason))
                }
            }
        } else {
            let buf = match sink {
                ReceiveSink::Memory(buf) => buf,
                ReceiveSink::CStore(_) => unreachable!("non-C-STORE data sink is always in-memory"),
            };
            let ts = TransferSyntaxRegistry
                .get(&transfer_syntax)
                .unwrap_or_else(|| TransferSyntaxRegistry.get("1.2.840.10008.1.2").unwrap());
            let dataset =
                InMemDicomObject::read_dataset_with_ts(buf.as_slice(), ts).context(DecodeDatasetSnafu)?;

            let message = DicomMessage {
                command: pending.command,
                dataset: Some(dataset),
                presentation_context_id: pending.presentation_context_id,
                command_field: pending.command_field,
                dataset_transfer_syntax: Some(transfer_syntax),
            };
            Ok(ReassembleOutcome::Delivered(message))
        }
    }
}

fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.value().to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
}
