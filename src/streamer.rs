//! The WAL streamer: receives the upstream WAL stream live and lays it
//! down as segment files in the archive.
//!
//! Segments are written under `<archive>/wal/` in the standard naming
//! scheme; the segment currently being received carries a `.partial`
//! suffix and is renamed once its last byte arrived and is fsynced.
//! Write and flush positions move strictly forward
//! (`flush <= write <= server`); the flushed position is persisted to the
//! catalog so a restarted streamer resumes where the archive is durable.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use tokio_postgres::CopyBothDuplex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::catalog::descr::{StreamIdent, StreamStatus};
use crate::catalog::BackupCatalog;
use crate::error::{ArchiveError, Result};
use crate::stream::ReplicationSession;
use crate::wal::{segment_file_name, Lsn, SegmentNo, TimeLineId};

/* ---------------- copy-both message codec ---------------- */

const XLOG_DATA_TAG: u8 = b'w';
const KEEPALIVE_TAG: u8 = b'k';
const STATUS_UPDATE_TAG: u8 = b'r';

/// A WAL chunk relayed by the walsender.
#[derive(Debug)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct PrimaryKeepAlive {
    pub wal_end: Lsn,
    pub reply_requested: bool,
}

#[derive(Debug)]
pub enum WalMessage {
    XLogData(XLogData),
    KeepAlive(PrimaryKeepAlive),
}

impl WalMessage {
    /// Decode one CopyData payload from the replication stream.
    pub fn parse(mut buf: Bytes) -> Result<WalMessage> {
        if buf.is_empty() {
            return Err(ArchiveError::protocol("streaming", "empty message"));
        }
        let tag = buf.get_u8();
        match tag {
            XLOG_DATA_TAG => {
                if buf.remaining() < 24 {
                    return Err(ArchiveError::protocol("streaming", "short XLogData header"));
                }
                let wal_start = Lsn(buf.get_u64());
                let wal_end = Lsn(buf.get_u64());
                let _timestamp = buf.get_i64();
                Ok(WalMessage::XLogData(XLogData {
                    wal_start,
                    wal_end,
                    data: buf,
                }))
            }
            KEEPALIVE_TAG => {
                if buf.remaining() < 17 {
                    return Err(ArchiveError::protocol("streaming", "short keepalive"));
                }
                let wal_end = Lsn(buf.get_u64());
                let _timestamp = buf.get_i64();
                let reply_requested = buf.get_u8() != 0;
                Ok(WalMessage::KeepAlive(PrimaryKeepAlive {
                    wal_end,
                    reply_requested,
                }))
            }
            other => Err(ArchiveError::protocol(
                "streaming",
                format!("unexpected replication message tag {other:#x}"),
            )),
        }
    }
}

/// Microseconds since the Postgres epoch (2000-01-01), as status updates
/// carry it.
fn pg_timestamp_now() -> i64 {
    let pg_epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    (Utc::now() - pg_epoch).num_microseconds().unwrap_or(0)
}

/// Encode a standby status update reporting our positions upstream.
pub fn encode_status_update(write: Lsn, flush: Lsn, apply: Lsn) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 8 * 4 + 1);
    buf.put_u8(STATUS_UPDATE_TAG);
    buf.put_u64(write.0);
    buf.put_u64(flush.0);
    buf.put_u64(apply.0);
    buf.put_i64(pg_timestamp_now());
    buf.put_u8(0); // no reply requested
    buf.freeze()
}

/* ---------------- segment files ---------------- */

/// Writes received WAL into segment files, one file per segment, with the
/// open segment carrying the `.partial` suffix.
pub struct WalSegmentWriter {
    wal_dir: PathBuf,
    timeline: TimeLineId,
    seg_size: u64,
    file: Option<File>,
    current_segno: SegmentNo,
}

impl WalSegmentWriter {
    pub fn new(wal_dir: impl Into<PathBuf>, timeline: TimeLineId, seg_size: u64) -> Result<Self> {
        let wal_dir = wal_dir.into();
        std::fs::create_dir_all(&wal_dir)?;
        Ok(WalSegmentWriter {
            wal_dir,
            timeline,
            seg_size,
            file: None,
            current_segno: 0,
        })
    }

    fn partial_path(&self, segno: SegmentNo) -> PathBuf {
        self.wal_dir.join(format!(
            "{}.partial",
            segment_file_name(self.timeline, segno, self.seg_size)
        ))
    }

    fn final_path(&self, segno: SegmentNo) -> PathBuf {
        self.wal_dir
            .join(segment_file_name(self.timeline, segno, self.seg_size))
    }

    fn open_segment(&mut self, segno: SegmentNo) -> Result<()> {
        let path = self.partial_path(segno);
        let file = File::options().create(true).write(true).open(&path)?;
        file.set_len(self.seg_size)?;
        debug!("opened WAL segment {}", path.display());
        self.file = Some(file);
        self.current_segno = segno;
        Ok(())
    }

    /// The received segment is complete: fsync it and strip the partial
    /// suffix.
    fn finalize_segment(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let partial = self.partial_path(self.current_segno);
        let finished = self.final_path(self.current_segno);
        std::fs::rename(&partial, &finished)?;
        File::open(&self.wal_dir)?.sync_all()?;
        info!("completed WAL segment {}", finished.display());
        Ok(())
    }

    /// Write a WAL chunk beginning at `startpos`, crossing segment
    /// boundaries as needed. Returns the end position of the write.
    pub fn write(&mut self, startpos: Lsn, mut data: &[u8]) -> Result<Lsn> {
        use std::os::unix::fs::FileExt;

        let mut pos = startpos;
        while !data.is_empty() {
            let segno = pos.segment_number(self.seg_size);
            if self.file.is_none() || self.current_segno != segno {
                self.open_segment(segno)?;
            }
            let offset = pos.segment_offset(self.seg_size);
            let room = (self.seg_size - offset) as usize;
            let n = room.min(data.len());
            self.file
                .as_ref()
                .ok_or_else(|| ArchiveError::protocol("streaming", "no segment open"))?
                .write_all_at(&data[..n], offset)?;
            data = &data[n..];
            pos = pos + n as u64;
            if pos.segment_offset(self.seg_size) == 0 {
                self.finalize_segment()?;
            }
        }
        Ok(pos)
    }

    /// Durably store what has been written to the open segment.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = &self.file {
            file.sync_data()?;
        }
        Ok(())
    }
}

/* ---------------- receive loop ---------------- */

/// One streamer: receives WAL for an archive until cancelled or the
/// connection drops.
pub struct WalReceiver<'a> {
    catalog: &'a BackupCatalog,
    ident: &'a mut StreamIdent,
    cancel: CancellationToken,
    status_interval: Duration,
}

impl<'a> WalReceiver<'a> {
    pub fn new(
        catalog: &'a BackupCatalog,
        ident: &'a mut StreamIdent,
        cancel: CancellationToken,
        status_interval: Duration,
    ) -> Self {
        WalReceiver {
            catalog,
            ident,
            cancel,
            status_interval,
        }
    }

    fn start_replication_command(&self, startpoint: Lsn) -> String {
        let mut cmd = String::from("START_REPLICATION");
        if !self.ident.slot_name.is_empty() {
            cmd.push_str(&format!(" SLOT {}", self.ident.slot_name));
        }
        cmd.push_str(&format!(" PHYSICAL {startpoint}"));
        cmd
    }

    /// Stream WAL into `wal_dir`. Returns cleanly on cancellation; any
    /// protocol or I/O failure propagates after the positions were pushed
    /// to the catalog as far as they were durable.
    pub async fn run(&mut self, session: &ReplicationSession, wal_dir: &Path) -> Result<()> {
        let seg_size = self.ident.wal_segment_size;
        // Physical replication always starts at a segment boundary.
        let startpoint = self.ident.xlogpos.segment_start(seg_size);
        let mut writer = WalSegmentWriter::new(wal_dir, self.ident.timeline, seg_size)?;

        let command = self.start_replication_command(startpoint);
        info!("starting replication: {command}");
        let duplex: CopyBothDuplex<Bytes> = session.client().copy_both_simple(&command).await?;
        let mut duplex = Box::pin(duplex);

        self.ident.status = StreamStatus::Streaming;
        self.catalog
            .update_stream_status(self.ident.id, StreamStatus::Streaming)?;
        // The write cursor restarts at the segment boundary we asked for.
        self.ident.write_position = startpoint;
        self.ident.flush_position = startpoint;

        let mut last_status = tokio::time::Instant::now();
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("streamer interrupted");
                    break;
                }
                message = duplex.next() => message,
            };
            let Some(message) = message else {
                warn!("replication stream closed by server");
                break;
            };

            match WalMessage::parse(message?)? {
                WalMessage::XLogData(xlog) => {
                    trace!(
                        "XLogData [{}, {}), {} bytes",
                        xlog.wal_start,
                        xlog.wal_end,
                        xlog.data.len()
                    );
                    self.ident.update_server_position(xlog.wal_end);
                    let end = writer.write(xlog.wal_start, &xlog.data)?;
                    self.ident.update_write_position(end)?;
                }
                WalMessage::KeepAlive(keepalive) => {
                    trace!("keepalive up to {}", keepalive.wal_end);
                    self.ident.update_server_position(keepalive.wal_end);
                    if keepalive.reply_requested {
                        self.send_status(&mut writer, duplex.as_mut()).await?;
                        last_status = tokio::time::Instant::now();
                    }
                }
            }

            if last_status.elapsed() >= self.status_interval {
                self.send_status(&mut writer, duplex.as_mut()).await?;
                last_status = tokio::time::Instant::now();
            }
        }

        // Leave a durable restart point behind.
        writer.flush()?;
        self.ident.update_flush_position(self.ident.write_position)?;
        self.catalog
            .update_stream_position(self.ident.id, self.ident.flush_position)?;
        self.ident.status = StreamStatus::Shutdown;
        self.catalog
            .update_stream_status(self.ident.id, StreamStatus::Shutdown)?;
        Ok(())
    }

    /// Flush written WAL, advance the flush position and report all
    /// positions upstream; the durable position also lands in the catalog.
    async fn send_status(
        &mut self,
        writer: &mut WalSegmentWriter,
        mut duplex: Pin<&mut CopyBothDuplex<Bytes>>,
    ) -> Result<()> {
        writer.flush()?;
        self.ident.update_flush_position(self.ident.write_position)?;
        self.catalog
            .update_stream_position(self.ident.id, self.ident.flush_position)?;
        let update = encode_status_update(
            self.ident.write_position,
            self.ident.flush_position,
            self.ident.apply_position,
        );
        duplex.send(update).await?;
        trace!(
            "status update: write {} flush {}",
            self.ident.write_position,
            self.ident.flush_position
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_xlog_data_message() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0x0100_0000);
        buf.put_u64(0x0100_0010);
        buf.put_i64(777);
        buf.put_slice(b"wal bytes");
        match WalMessage::parse(buf.freeze()).unwrap() {
            WalMessage::XLogData(xlog) => {
                assert_eq!(xlog.wal_start, Lsn(0x0100_0000));
                assert_eq!(xlog.wal_end, Lsn(0x0100_0010));
                assert_eq!(&xlog.data[..], b"wal bytes");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parse_keepalive_message() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x0200_0000);
        buf.put_i64(0);
        buf.put_u8(1);
        match WalMessage::parse(buf.freeze()).unwrap() {
            WalMessage::KeepAlive(keepalive) => {
                assert_eq!(keepalive.wal_end, Lsn(0x0200_0000));
                assert!(keepalive.reply_requested);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(WalMessage::parse(Bytes::new()).is_err());
        assert!(WalMessage::parse(Bytes::from_static(b"x")).is_err());
        assert!(WalMessage::parse(Bytes::from_static(b"w123")).is_err());
    }

    #[test]
    fn status_update_layout() {
        let update = encode_status_update(Lsn(0x10), Lsn(0x8), Lsn(0));
        assert_eq!(update.len(), 34);
        assert_eq!(update[0], b'r');
        let mut rest = update.slice(1..);
        assert_eq!(rest.get_u64(), 0x10);
        assert_eq!(rest.get_u64(), 0x8);
        assert_eq!(rest.get_u64(), 0);
        let _timestamp = rest.get_i64();
        assert_eq!(rest.get_u8(), 0);
    }

    #[test]
    fn segment_writer_rolls_over() {
        let dir = tempfile::tempdir().unwrap();
        // tiny segments keep the test readable
        let seg_size = 32u64;
        let mut writer = WalSegmentWriter::new(dir.path(), 1, seg_size).unwrap();

        // 40 bytes from lsn 16: fills segment 0 from its middle, completes
        // it, and spills 24 bytes into segment 1
        let end = writer.write(Lsn(16), &[7u8; 40]).unwrap();
        assert_eq!(end, Lsn(56));

        let seg0 = dir.path().join(segment_file_name(1, 0, seg_size));
        assert!(seg0.exists(), "completed segment must lose .partial");
        let seg1 = dir
            .path()
            .join(format!("{}.partial", segment_file_name(1, 1, seg_size)));
        assert!(seg1.exists());

        let seg0_data = std::fs::read(&seg0).unwrap();
        assert_eq!(seg0_data.len() as u64, seg_size);
        assert!(seg0_data[16..].iter().all(|&b| b == 7));

        writer.flush().unwrap();
        let seg1_data = std::fs::read(&seg1).unwrap();
        assert!(seg1_data[..24].iter().all(|&b| b == 7));
    }
}
