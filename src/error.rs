//! Crate-wide error types.
//!
//! Per-module errors (PDU decode/encode, association negotiation, service
//! engine I/O) each define their own `Error` type close to the code that
//! raises them, in the manner of `dicom_ul::pdu::reader`/`writer`. This
//! module composes them into the handful of kinds the rest of the engine
//! reasons about when deciding whether a failure is fatal to the
//! association (see spec §7, "Error Handling Design").

use snafu::Snafu;

use crate::pdu::{reader, writer};
use crate::{dimse, reassemble, sink, transcode};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level engine error.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// malformed or otherwise non-conformant PDU on the wire
    #[snafu(display("protocol error decoding PDU"))]
    Protocol { source: reader::Error },

    /// failed to encode an outgoing PDU
    #[snafu(display("protocol error encoding PDU"))]
    Encode { source: writer::Error },

    /// the underlying byte stream failed
    #[snafu(display("transport error"))]
    Transport { source: std::io::Error },

    /// no presentation context could be found for an outgoing message
    #[snafu(display("no acceptable presentation context for {sop_class_uid}"))]
    Negotiation { sop_class_uid: String },

    /// the association was aborted or released and can no longer be used
    #[snafu(display("connection is closed"))]
    Closed,

    /// a DIMSE command was received for which no provider is registered
    #[snafu(display("no provider registered for command field {command_field:#06x}"))]
    UnimplementedRole { command_field: u16 },

    /// a PDU arrived that is not valid in the current association state
    #[snafu(display("unexpected PDU type {pdu_type:#04x} for the current association state"))]
    UnexpectedPdu { pdu_type: u8 },

    /// failed to build or parse a DIMSE command set
    #[snafu(display("DIMSE error"))]
    Dimse { source: dimse::Error },

    /// failed to reassemble an incoming message from its PDV fragments
    #[snafu(display("reassembly error"))]
    Reassemble { source: reassemble::Error },

    /// the C-STORE receive sink failed
    #[snafu(display("sink error"))]
    Sink { source: sink::SinkError },

    /// failed to transcode an outgoing data set to the negotiated transfer syntax
    #[snafu(display("failed to transcode from {from} to {to}"))]
    Transcode {
        from: String,
        to: String,
        source: transcode::Error,
    },

    /// failed to re-encode a data set for transmission
    #[snafu(display("failed to encode outgoing data set"))]
    EncodeDataset { source: dicom_object::WriteError },
}

impl From<reader::Error> for Error {
    fn from(source: reader::Error) -> Self {
        Error::Protocol { source }
    }
}

impl From<writer::Error> for Error {
    fn from(source: writer::Error) -> Self {
        Error::Encode { source }
    }
}

impl From<dimse::Error> for Error {
    fn from(source: dimse::Error) -> Self {
        Error::Dimse { source }
    }
}

impl From<reassemble::Error> for Error {
    fn from(source: reassemble::Error) -> Self {
        Error::Reassemble { source }
    }
}

impl From<sink::SinkError> for Error {
    fn from(source: sink::SinkError) -> Self {
        Error::Sink { source }
    }
}
