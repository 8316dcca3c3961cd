//! The DICOM upper layer service engine.
//!
//! This crate implements the half-duplex, message-oriented state machine
//! that sits on top of a reliable byte stream and turns it into a DICOM
//! association: PDU framing ([`pdu`]), presentation-context negotiation
//! ([`assoc`]), DIMSE message fragmentation/reassembly ([`pdata`],
//! [`reassemble`]), and the connection lifecycle that ties all of it
//! together ([`service`]).
//!
//! The engine does not open sockets, parse DICOM datasets, or transcode
//! between transfer syntaxes: those are supplied by the host through the
//! collaborator traits in [`roles`] and [`sink`], and through the
//! `dicom-encoding`/`dicom-object` types threaded through the API.
//!
//! ## Features
//!
//! This crate is asynchronous only, built on `tokio`. The byte stream is
//! any type implementing [`tokio::io::AsyncRead`] + [`tokio::io::AsyncWrite`]
//! + `Unpin` + `Send`; establishing the underlying connection (including
//! TLS) is left to the caller.

pub mod address;
pub mod assoc;
pub mod dimse;
pub mod error;
pub mod options;
pub mod pdata;
pub mod pdu;
pub mod reassemble;
pub mod roles;
pub mod service;
pub mod sink;
pub mod transcode;

/// The current implementation class UID generically referring to this engine.
///
/// Automatically generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.156227610253341005307660858504280353501";

/// The current implementation version name generically referring to this engine.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-UL-ENGINE 0.1.0";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use assoc::Association;
pub use error::{Error, Result};
pub use options::ServiceOptions;
pub use pdu::{read_pdu, write_pdu, Pdu};
pub use service::{ServiceEngine, ServiceHandle};
