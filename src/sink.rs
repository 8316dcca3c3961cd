//! The C-STORE receive sink: where inbound dataset bytes for a
//! large object are spilled while the reassembler streams them in
//! (spec §3, §4.4, §9 "Temp-file sink ownership").
//!
//! The default [`TempFileSink`] follows the same file-meta-information
//! construction `storescp` performs inline: a `FileMetaTableBuilder` is
//! filled in from the presentation context and command set, written
//! ahead of the dataset bytes, and the whole file is later reopened
//! with [`InMemDicomObject::open_file`] to hand the host a parsed
//! object. The temp file outlives the write handle: [`CStoreSink::File`]
//! keeps the [`tempfile::NamedTempFile`] (which owns the filesystem
//! entry) separate from the [`tokio::fs::File`] used to write to it, so
//! `finalize` can reopen the same path for reading after the write
//! handle is dropped.

use std::io;
use std::path::PathBuf;

use dicom_object::{DefaultDicomObject, FileMetaTable, FileMetaTableBuilder, InMemDicomObject};
use snafu::{ResultExt, Snafu};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SinkError {
    #[snafu(display("failed to create spillover file"))]
    CreateTempFile { source: io::Error },

    #[snafu(display("failed to write to spillover file"))]
    WriteTempFile { source: io::Error },

    #[snafu(display("failed to build file meta information"))]
    BuildMeta { source: dicom_object::meta::Error },

    #[snafu(display("failed to parse spilled-over file"))]
    ParseFile { source: dicom_object::ReadError },
}

pub type Result<T, E = SinkError> = std::result::Result<T, E>;

/// Everything the sink provider needs to synthesize `FileMetaInformation`
/// for a C-STORE request (spec §4.4, step 2).
#[derive(Debug, Clone, Copy)]
pub struct CStoreContext<'a> {
    pub sop_class_uid: &'a str,
    pub sop_instance_uid: &'a str,
    pub transfer_syntax: &'a str,
    pub calling_ae_title: &'a str,
    pub remote_implementation_class_uid: Option<&'a str>,
    pub remote_implementation_version_name: Option<&'a str>,
}

/// A destination for the bytes of one reassembled data set.
pub enum CStoreSink {
    /// The common case: small enough to comfortably hold in memory.
    Memory(Vec<u8>),
    /// Large-object spillover: dataset bytes are streamed straight to a
    /// file as they arrive instead of being buffered.
    File {
        temp: tempfile::NamedTempFile,
        file: tokio::fs::File,
    },
}

impl CStoreSink {
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            CStoreSink::Memory(buf) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            CStoreSink::File { file, .. } => file
                .write_all(bytes)
                .await
                .context(WriteTempFileSnafu),
        }
    }
}

/// Host-overridable policy for where and how a C-STORE request's data
/// set is received (spec §6, "C-STORE sink provider").
pub trait CStoreSinkProvider: Send + Sync {
    /// Open a sink for a newly arrived C-STORE request's data set,
    /// writing the synthesized file meta information ahead of the
    /// dataset bytes that will follow.
    fn create_sink(&self, ctx: &CStoreContext<'_>) -> impl std::future::Future<Output = Result<CStoreSink>> + Send;

    /// Close the sink and, if this provider wants to hand a parsed
    /// object back to the host's `on_c_store_request` upcall, produce
    /// it here. Returning `Ok(None)` is how an alternate implementation
    /// (e.g. one writing straight to network storage) opts out.
    fn finalize(
        &self,
        sink: CStoreSink,
        ctx: &CStoreContext<'_>,
    ) -> impl std::future::Future<Output = Result<Option<DefaultDicomObject>>> + Send;

    /// Called when the dataset could not be decoded after reassembly,
    /// instead of aborting the association (spec §4.4, §7).
    fn exception(&self, sink_name: Option<&str>, err: &SinkError) {
        let _ = (sink_name, err);
    }
}

/// The default sink provider: spills to a named temporary file in the
/// configured (or system default) directory.
#[derive(Debug, Clone, Default)]
pub struct TempFileSink {
    dir: Option<PathBuf>,
}

impl TempFileSink {
    pub fn new() -> Self {
        TempFileSink { dir: None }
    }

    /// Spill temporary files into `dir` instead of the system default.
    pub fn with_directory(dir: impl Into<PathBuf>) -> Self {
        TempFileSink { dir: Some(dir.into()) }
    }

    fn build_meta(&self, ctx: &CStoreContext<'_>) -> Result<FileMetaTable> {
        let mut builder = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(ctx.sop_class_uid)
            .media_storage_sop_instance_uid(ctx.sop_instance_uid)
            .transfer_syntax(ctx.transfer_syntax)
            .source_application_entity_title(ctx.calling_ae_title);
        if let Some(uid) = ctx.remote_implementation_class_uid {
            builder = builder.implementation_class_uid(uid);
        }
        if let Some(name) = ctx.remote_implementation_version_name {
            builder = builder.implementation_version_name(name);
        }
        builder.build().context(BuildMetaSnafu)
    }
}

impl CStoreSinkProvider for TempFileSink {
    async fn create_sink(&self, ctx: &CStoreContext<'_>) -> Result<CStoreSink> {
        let meta = self.build_meta(ctx)?;

        let mut header = Vec::new();
        header.extend_from_slice(&[0u8; 128]);
        header.extend_from_slice(b"DICM");
        meta.write(&mut header).context(BuildMetaSnafu)?;

        let temp = match &self.dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new(),
        }
        .context(CreateTempFileSnafu)?;

        let std_file = temp.reopen().context(CreateTempFileSnafu)?;
        let mut file = tokio::fs::File::from_std(std_file);
        file.write_all(&header).await.context(WriteTempFileSnafu)?;

        Ok(CStoreSink::File { temp, file })
    }

    async fn finalize(
        &self,
        sink: CStoreSink,
        _ctx: &CStoreContext<'_>,
    ) -> Result<Option<DefaultDicomObject>> {
        match sink {
            CStoreSink::Memory(_) => Ok(None),
            CStoreSink::File { temp, file } => {
                drop(file);
                let path = temp.path().to_path_buf();
                let obj = tokio::task::spawn_blocking(move || dicom_object::open_file(&path))
                    .await
                    .expect("blocking file parse task panicked")
                    .context(ParseFileSnafu)?;
                // `temp` is dropped (and the file removed) once this
                // function returns; the parsed object above already
                // holds everything the upcall needs.
                drop(temp);
                Ok(Some(obj))
            }
        }
    }
}
