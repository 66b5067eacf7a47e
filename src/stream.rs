//! Replication sessions against the upstream cluster.
//!
//! A session wraps one libpq-protocol connection opened from a catalog
//! connection descriptor. `IDENTIFY_SYSTEM` populates a [`StreamIdent`]
//! with the system identifier, timeline, current WAL position and the
//! server's segment size; base-backup and WAL streaming build on top of
//! the identified session.

use std::str::FromStr;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::descr::{
    ConnectionDescr, ReplicationSlot, SlotStatus, StreamIdent, StreamStatus,
};
use crate::error::{ArchiveError, Result};
use crate::wal::{parse_wal_segment_size, Lsn, DEFAULT_WAL_SEGMENT_SIZE};

/// Wire connect timeout; upstream library timeouts propagate as errors.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ReplicationSession {
    client: Client,
    conn_task: JoinHandle<()>,
    cancel_on_drop: Option<tokio_util::sync::DropGuard>,
}

impl ReplicationSession {
    /// Open a session from a connection descriptor. An explicit DSN wins
    /// over the individual host/port/user/database fields.
    pub async fn connect(con: &ConnectionDescr) -> Result<Self> {
        let mut config = if !con.dsn.is_empty() {
            Config::from_str(&con.dsn)?
        } else {
            let mut config = Config::new();
            config
                .host(&con.pghost)
                .port(con.pgport as u16)
                .user(&con.pguser);
            if !con.pgdatabase.is_empty() {
                config.dbname(&con.pgdatabase);
            }
            config
        };
        config.application_name("archivekeeper");
        config.connect_timeout(CONNECT_TIMEOUT);

        let (client, connection) = config.connect(NoTls).await?;
        debug!("connected to {}:{}", con.pghost, con.pgport);

        // The connection object does the actual wire traffic; let it run
        // on its own and tear it down when the session is dropped.
        let conn_task_cancel = CancellationToken::new();
        let conn_task = tokio::spawn({
            let conn_task_cancel = conn_task_cancel.clone();
            async move {
                tokio::select! {
                    _ = conn_task_cancel.cancelled() => {}
                    res = connection => {
                        if let Err(e) = res {
                            warn!("replication connection closed: {e}");
                        }
                    }
                }
            }
        });

        Ok(ReplicationSession {
            client,
            conn_task,
            cancel_on_drop: Some(conn_task_cancel.drop_guard()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn first_row(response: Vec<SimpleQueryMessage>, phase: &str) -> Result<SimpleQueryRow> {
        response
            .into_iter()
            .find_map(|msg| match msg {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .ok_or_else(|| ArchiveError::protocol(phase, "no result row"))
    }

    /// Identify the session: system id, active timeline, current WAL
    /// position and the server's WAL segment size.
    pub async fn identify(&self, archive_id: i64) -> Result<StreamIdent> {
        let response = self.client.simple_query("IDENTIFY_SYSTEM").await?;
        let row = Self::first_row(response, "identification")?;

        let systemid = row
            .get(0)
            .ok_or_else(|| ArchiveError::protocol("identification", "missing systemid"))?
            .to_string();
        let timeline = row
            .get(1)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ArchiveError::protocol("identification", "bad timeline"))?;
        let xlogpos: Lsn = row
            .get(2)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ArchiveError::protocol("identification", "bad xlogpos"))?;

        let wal_segment_size = self.wal_segment_size().await;
        info!(
            "identified system {systemid} timeline {timeline} at {xlogpos}, \
             wal_segment_size {wal_segment_size}"
        );

        let mut ident = StreamIdent {
            archive_id,
            systemid,
            timeline,
            xlogpos,
            status: StreamStatus::Identified,
            wal_segment_size,
            ..Default::default()
        };
        ident.update_server_position(xlogpos);
        Ok(ident)
    }

    /// The server's `wal_segment_size`. Old servers reject SHOW on a
    /// walsender connection; assume the initdb default then.
    async fn wal_segment_size(&self) -> u64 {
        let response = match self.client.simple_query("SHOW wal_segment_size").await {
            Ok(response) => response,
            Err(e) => {
                warn!("SHOW wal_segment_size failed ({e}), assuming default");
                return DEFAULT_WAL_SEGMENT_SIZE;
            }
        };
        Self::first_row(response, "show wal_segment_size")
            .ok()
            .and_then(|row| row.get(0).map(str::to_string))
            .and_then(|text| parse_wal_segment_size(&text).ok())
            .unwrap_or(DEFAULT_WAL_SEGMENT_SIZE)
    }

    /// Create a physical replication slot. With `existing_ok`, a slot that
    /// is already there is reported rather than an error.
    pub async fn create_physical_slot(
        &self,
        slot_name: &str,
        existing_ok: bool,
    ) -> Result<ReplicationSlot> {
        let command = format!("CREATE_REPLICATION_SLOT {slot_name} PHYSICAL RESERVE_WAL");
        match self.client.simple_query(&command).await {
            Ok(response) => {
                let row = Self::first_row(response, "create replication slot")?;
                let consistent_point = row
                    .get(1)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(Lsn::INVALID);
                Ok(ReplicationSlot {
                    slot_name: slot_name.to_string(),
                    consistent_point,
                    existing_ok,
                    status: SlotStatus::Ok,
                })
            }
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) && existing_ok => {
                debug!("replication slot {slot_name} already exists");
                Ok(ReplicationSlot {
                    slot_name: slot_name.to_string(),
                    consistent_point: Lsn::INVALID,
                    existing_ok,
                    status: SlotStatus::Exists,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tear the session down, cancelling the connection driver.
    pub async fn disconnect(mut self) {
        if let Some(guard) = self.cancel_on_drop.take() {
            drop(guard);
        }
        let _ = self.conn_task.await;
    }
}
