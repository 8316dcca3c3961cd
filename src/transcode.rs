//! Data set transcoding between transfer syntaxes (spec §4.5, §6,
//! "DatasetTranscoder").
//!
//! The send path (`service::run_sender`) re-encodes a data set into the
//! transfer syntax accepted for its presentation context when that
//! differs from the syntax the dataset currently carries. Codec-bearing
//! transfer syntaxes (JPEG, RLE, ...) require a pixel-data compressor
//! this crate does not carry; [`RegistryTranscoder`] handles the
//! codec-free cases itself and reports [`Error::CodecRequired`] for the
//! rest, the same distinction `dicom-encoding`'s own transfer syntax
//! registry draws between a fully supported and a stub entry.

use dicom_encoding::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("unknown transfer syntax `{uid}`"))]
    UnknownTransferSyntax { uid: String },

    #[snafu(display("failed to re-encode data set"))]
    Encode { source: dicom_object::WriteError },

    #[snafu(display("failed to parse re-encoded data set"))]
    Decode { source: dicom_object::ReadError },

    #[snafu(display(
        "transcoding into a pixel-data-compressing transfer syntax is not supported by the \
         default transcoder; supply a DatasetTranscoder backed by a codec"
    ))]
    CodecRequired,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Host-overridable policy for converting a data set between transfer
/// syntaxes (spec §6). Synchronous: re-encoding a single command-sized
/// data set does not warrant async plumbing, and a host wrapping a
/// native pixel-data codec library is typically sync itself.
pub trait DatasetTranscoder: Send + Sync {
    /// Convert `dataset`, currently encoded per `from_transfer_syntax`,
    /// to an equivalent data set suitable for `to_transfer_syntax`.
    /// Returning the same object unchanged (modulo transfer syntax
    /// bookkeeping kept by the caller) is valid when the two syntaxes
    /// share the same pixel-data representation.
    fn transcode(
        &self,
        dataset: &InMemDicomObject,
        from_transfer_syntax: &str,
        to_transfer_syntax: &str,
    ) -> Result<InMemDicomObject>;
}

/// The default transcoder: handles VR-explicitness/endianness
/// conversions between codec-free transfer syntaxes by re-encoding
/// through the element API, and declines anything that would require
/// compressing or decompressing pixel data.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryTranscoder;

impl DatasetTranscoder for RegistryTranscoder {
    fn transcode(
        &self,
        dataset: &InMemDicomObject,
        from_transfer_syntax: &str,
        to_transfer_syntax: &str,
    ) -> Result<InMemDicomObject> {
        if from_transfer_syntax == to_transfer_syntax {
            return Ok(dataset.clone());
        }

        let from_ts = TransferSyntaxRegistry
            .get(from_transfer_syntax)
            .context(UnknownTransferSyntaxSnafu {
                uid: from_transfer_syntax,
            })?;
        let to_ts = TransferSyntaxRegistry
            .get(to_transfer_syntax)
            .context(UnknownTransferSyntaxSnafu {
                uid: to_transfer_syntax,
            })?;

        ensure!(from_ts.is_fully_supported() && to_ts.is_codec_free(), CodecRequiredSnafu);

        let mut bytes = Vec::new();
        dataset
            .write_dataset_with_ts(&mut bytes, to_ts)
            .context(EncodeSnafu)?;
        InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), to_ts).context(DecodeSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;

    #[test]
    fn same_transfer_syntax_is_a_no_op() {
        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, "Doe^John"),
        ));

        let transcoder = RegistryTranscoder;
        let out = transcoder
            .transcode(&dataset, "1.2.840.10008.1.2", "1.2.840.10008.1.2")
            .unwrap();
        assert_eq!(
            out.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Doe^John"
        );
    }

    #[test]
    fn implicit_to_explicit_little_endian_reencodes() {
        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, "Doe^John"),
        ));

        let transcoder = RegistryTranscoder;
        let out = transcoder
            .transcode(&dataset, "1.2.840.10008.1.2", "1.2.840.10008.1.2.1")
            .unwrap();
        assert_eq!(
            out.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Doe^John"
        );
    }

    #[test]
    fn jpeg_baseline_target_requires_codec() {
        let dataset = InMemDicomObject::new_empty();
        let transcoder = RegistryTranscoder;
        let err = transcoder
            .transcode(&dataset, "1.2.840.10008.1.2", "1.2.840.10008.1.2.4.50")
            .unwrap_err();
        assert!(matches!(err, Error::CodecRequired));
    }
}
