//! The PDV stream (spec §4.3, component C3): a write-only sink that
//! slices outgoing DIMSE bytes into PDVs, grouping PDVs into PData PDUs
//! that respect the negotiated maximum PDU size.
//!
//! Modeled as a narrow trait (`write`, `set_is_command`, `flush`) rather
//! than a general byte-stream subclass, per the "PDV streaming as a
//! write sink" design note: a [`PdvStream`] owns exactly the framing
//! state it needs and forwards finished PDUs to its [`PduSink`]
//! collaborator, which the service engine implements over its
//! `pdu_queue`.

use std::future::Future;
use std::mem;

use crate::pdu::{PDataValue, PDataValueType, Pdu};

/// What a [`PdvStream`] hands finished PDUs to. Implemented by the
/// service engine's connection handle over its `pdu_queue` (spec §4.5,
/// `send_pdu`); narrow and `async fn`-in-trait so no boxing is needed
/// on the hot path.
pub trait PduSink: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Enqueue `pdu` for transmission, applying backpressure per
    /// `MaximumPDUsInQueue` if the queue is full.
    fn send_pdu(&mut self, pdu: Pdu) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A write-only sink bound to one `(presentation_context_id,
/// command/data mode)` pair for the duration of a single outgoing
/// DIMSE message (spec §4.3).
pub struct PdvStream<S: PduSink> {
    sink: S,
    presentation_context_id: u8,
    is_command: bool,
    max_command_buffer: u32,
    max_data_buffer: u32,
    /// Bytes accumulated for the PDV currently being built.
    buffer: Vec<u8>,
    /// PDVs already finalized for the PDU currently being built.
    pdu_values: Vec<PDataValue>,
    /// Size in bytes the current PDU's body would occupy on the wire
    /// if flushed right now (sum of each finalized PDV's 6-byte item
    /// header plus its payload).
    pdu_size: u32,
}

impl<S: PduSink> PdvStream<S> {
    /// Start a new PDV stream. `max_command_buffer`/`max_data_buffer`
    /// are the already-combined effective maxima (spec §4.3: `max =
    /// min(pdu_max, mode_buffer)`), as computed by
    /// [`crate::options::ServiceOptions::effective_command_buffer`] /
    /// [`crate::options::ServiceOptions::effective_data_buffer`].
    pub fn new(
        sink: S,
        presentation_context_id: u8,
        max_command_buffer: u32,
        max_data_buffer: u32,
    ) -> Self {
        PdvStream {
            sink,
            presentation_context_id,
            is_command: true,
            max_command_buffer,
            max_data_buffer,
            buffer: Vec::new(),
            pdu_values: Vec::new(),
            pdu_size: 0,
        }
    }

    fn mode_max(&self) -> u32 {
        if self.is_command {
            self.max_command_buffer
        } else {
            self.max_data_buffer
        }
    }

    fn value_type(&self) -> PDataValueType {
        if self.is_command {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        }
    }

    /// Append `bytes` to the stream, emitting PDVs and flushing PDUs
    /// as the negotiated size limits are reached.
    pub async fn write(&mut self, mut bytes: &[u8]) -> Result<(), S::Error> {
        while !bytes.is_empty() {
            let max = self.mode_max();
            if self.pdu_size + 6 >= max {
                self.flush_pdu().await?;
            }

            let capacity = (max - self.pdu_size - 6) as usize;
            let room = capacity.saturating_sub(self.buffer.len());
            if room == 0 {
                self.emit_pdv(false);
                continue;
            }

            let take = room.min(bytes.len());
            self.buffer.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.buffer.len() >= capacity {
                self.emit_pdv(false);
            }
        }
        Ok(())
    }

    /// Flush any buffered command bytes as a non-last command PDV,
    /// then switch to dataset mode. Must be called between the
    /// command and dataset writes of a single DIMSE message; a no-op
    /// if `command` is already `false`.
    pub fn set_is_command(&mut self, command: bool) {
        if command == self.is_command {
            return;
        }
        if !self.buffer.is_empty() {
            self.emit_pdv(false);
        }
        self.is_command = command;
    }

    /// Emit any remaining buffered bytes as a PDV, marking it (or the
    /// most recently finalized PDV, if nothing remains buffered)
    /// `is_last` when `last` is true, then forward the accumulated PDU
    /// to the sink.
    pub async fn flush(&mut self, last: bool) -> Result<(), S::Error> {
        if !self.buffer.is_empty() {
            self.emit_pdv(last);
        } else if last {
            if let Some(value) = self.pdu_values.last_mut() {
                value.is_last = true;
            } else {
                self.pdu_values.push(PDataValue {
                    presentation_context_id: self.presentation_context_id,
                    value_type: self.value_type(),
                    is_last: true,
                    data: Vec::new(),
                });
            }
        }
        self.flush_pdu().await
    }

    /// Consume the stream, returning the underlying sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn emit_pdv(&mut self, is_last: bool) {
        let data = mem::take(&mut self.buffer);
        self.pdu_size += 6 + data.len() as u32;
        self.pdu_values.push(PDataValue {
            presentation_context_id: self.presentation_context_id,
            value_type: self.value_type(),
            is_last,
            data,
        });
    }

    async fn flush_pdu(&mut self) -> Result<(), S::Error> {
        if self.pdu_values.is_empty() {
            return Ok(());
        }
        let data = mem::take(&mut self.pdu_values);
        self.pdu_size = 0;
        self.sink.send_pdu(Pdu::PData { data }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    struct CollectingSink {
        pdus: Vec<Pdu>,
    }

    impl PduSink for CollectingSink {
        type Error = Infallible;

        async fn send_pdu(&mut self, pdu: Pdu) -> Result<(), Infallible> {
            self.pdus.push(pdu);
            Ok(())
        }
    }

    fn all_pdv(pdus: &[Pdu]) -> Vec<&PDataValue> {
        pdus.iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data.iter(),
                _ => [].iter(),
            })
            .collect()
    }

    #[tokio::test]
    async fn small_message_is_one_pdv_per_mode() {
        let sink = CollectingSink { pdus: Vec::new() };
        let mut stream = PdvStream::new(sink, 1, 16_384, 16_384);

        stream.write(b"command-bytes").await.unwrap();
        stream.set_is_command(false);
        stream.write(b"dataset-bytes").await.unwrap();
        stream.flush(true).await.unwrap();

        let sink = stream.into_sink();
        let pdvs = all_pdv(&sink.pdus);
        assert_eq!(pdvs.len(), 2);
        assert_eq!(pdvs[0].value_type, PDataValueType::Command);
        assert!(!pdvs[0].is_last);
        assert_eq!(pdvs[0].data, b"command-bytes");
        assert_eq!(pdvs[1].value_type, PDataValueType::Data);
        assert!(pdvs[1].is_last);
        assert_eq!(pdvs[1].data, b"dataset-bytes");
    }

    #[tokio::test]
    async fn large_write_is_fragmented_across_pdus() {
        let sink = CollectingSink { pdus: Vec::new() };
        // small buffer to force fragmentation across multiple PDUs
        let mut stream = PdvStream::new(sink, 1, 32, 32);

        let payload = vec![0xAB; 100];
        stream.write(&payload).await.unwrap();
        stream.flush(true).await.unwrap();

        let sink = stream.into_sink();
        assert!(sink.pdus.len() > 1, "expected more than one PDU to be emitted");

        let pdvs = all_pdv(&sink.pdus);
        let total: usize = pdvs.iter().map(|v| v.data.len()).sum();
        assert_eq!(total, payload.len());
        assert!(pdvs.iter().rev().skip(1).all(|v| !v.is_last));
        assert!(pdvs.last().unwrap().is_last);
    }

    #[tokio::test]
    async fn empty_message_flushes_single_empty_last_pdv() {
        let sink = CollectingSink { pdus: Vec::new() };
        let mut stream = PdvStream::new(sink, 1, 16_384, 16_384);
        stream.flush(true).await.unwrap();

        let sink = stream.into_sink();
        let pdvs = all_pdv(&sink.pdus);
        assert_eq!(pdvs.len(), 1);
        assert!(pdvs[0].is_last);
        assert!(pdvs[0].data.is_empty());
    }
}
