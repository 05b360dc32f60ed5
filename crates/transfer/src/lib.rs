//! File transfers: stream-initiation offers carried over in-band
//! bytestreams.
//!
//! Every transfer walks `Pending → Negotiating → Transferring` and ends in
//! exactly one of `Completed`, `Failed` or `Cancelled`. Once a transfer is
//! terminal it leaves the in-memory table, so late signals for it find
//! nothing to act on, and the store refuses to rewrite terminal rows.

pub mod offer;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xmpp_parsers::{iq::Iq, jid::Jid, minidom::Element};

use rookery_core::{
    Emitter, EventPayload,
    config::TransferConfig,
    event::{FileTransfer, TransferDirection, TransferState},
    jid::new_iq_id,
};
use rookery_storage::{Database, FromRow, Row, StorageError};
use rookery_xmpp::{IqResponse, OutboundError, ProtocolError, Stanza, outbound, router::NS_SI};

pub use offer::{IbbRequest, Offer, parse_ibb, parse_offer};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("file error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("transfer {id} cannot do that while {state:?}")]
    InvalidState { id: String, state: TransferState },

    #[error("{path} is {size} bytes, over the {max} byte limit")]
    TooLarge { path: String, size: u64, max: u64 },

    #[error("{0} is not a regular file")]
    NotAFile(String),

    #[error("negotiation of transfer {0} timed out")]
    NegotiationTimedOut(String),
}

/// What an outstanding iq of ours is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Offer,
    Open,
    Data,
    Close,
}

struct Active {
    transfer: FileTransfer,
    sid: String,
    /// Inbound only: the offer iq, answered on accept or reject.
    offer_iq: Option<String>,
    /// Acknowledged (outbound) or written (inbound) bytes.
    bytes: u64,
    seq: u16,
    /// Size of the block awaiting acknowledgement.
    in_flight: u64,
    file: Option<File>,
    deadline: Option<Instant>,
    last_report: Option<Instant>,
}

impl Active {
    fn new(transfer: FileTransfer, sid: String, offer_iq: Option<String>) -> Self {
        Self {
            transfer,
            sid,
            offer_iq,
            bytes: 0,
            seq: 0,
            in_flight: 0,
            file: None,
            deadline: None,
            last_report: None,
        }
    }

    /// Where inbound data collects until close. One per transfer, so offers
    /// of the same filename never share it.
    fn part_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.{}.part", self.transfer.local_path, self.transfer.id))
    }

    fn progress(&self) -> f64 {
        if self.transfer.size == 0 {
            return 1.0;
        }
        (self.bytes as f64 / self.transfer.size as f64).min(1.0)
    }
}

struct TransferRow(FileTransfer);

impl FromRow for TransferRow {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        let Ok(direction) = row.text(1, "direction")?.parse::<TransferDirection>();
        let state = row
            .text(7, "state")?
            .parse::<TransferState>()
            .map_err(StorageError::QueryFailed)?;
        Ok(TransferRow(FileTransfer {
            id: row.text(0, "id")?,
            direction,
            peer: row.text(2, "peer_jid")?,
            filename: row.text(3, "filename")?,
            size: u64::try_from(row.integer(4, "size")?).unwrap_or_default(),
            mime_type: row.opt_text(5),
            local_path: row.text(6, "local_path")?,
            state,
            progress: row.real(8, "progress")?,
            error: row.opt_text(9),
        }))
    }
}

const TRANSFER_COLUMNS: &str =
    "id, direction, peer_jid, filename, size, mime_type, local_path, state, progress, error";

fn new_transfer_id() -> String {
    format!("ft_{}", Uuid::new_v4())
}

/// Owns every live transfer of one account.
pub struct TransferManager<D: Database> {
    db: Arc<D>,
    emitter: Emitter,
    account: String,
    config: TransferConfig,
    negotiation_timeout: Duration,
    active: HashMap<String, Active>,
    /// Our outstanding iq ids.
    requests: HashMap<String, (String, Step)>,
    /// Bytestream session id to transfer id.
    sids: HashMap<String, String>,
}

impl<D: Database> TransferManager<D> {
    pub fn new(
        db: Arc<D>,
        emitter: Emitter,
        config: TransferConfig,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            account: emitter.account().to_string(),
            db,
            emitter,
            config,
            negotiation_timeout,
            active: HashMap::new(),
            requests: HashMap::new(),
            sids: HashMap::new(),
        }
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Offer `path` to `to`. Returns the offer iq; the transfer is
    /// `Negotiating` once this returns.
    pub async fn start(&mut self, to: &str, path: &Path) -> Result<Stanza, TransferError> {
        let metadata = fs::metadata(path).await?;
        let display = path.display().to_string();
        if !metadata.is_file() {
            return Err(TransferError::NotAFile(display));
        }
        let size = metadata.len();
        if size > self.config.max_file_size {
            return Err(TransferError::TooLarge {
                path: display,
                size,
                max: self.config.max_file_size,
            });
        }
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(String::from)
            .ok_or_else(|| TransferError::NotAFile(display.clone()))?;
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();

        let id = new_transfer_id();
        let iq_id = new_iq_id();
        let stanza = outbound::si_offer(&iq_id, to, &id, &filename, size, &mime_type)?;

        let transfer = FileTransfer {
            id: id.clone(),
            direction: TransferDirection::Outbound,
            peer: to.to_string(),
            filename,
            size,
            mime_type: Some(mime_type),
            local_path: display,
            state: TransferState::Pending,
            progress: 0.0,
            error: None,
        };
        self.insert(&transfer).await?;
        info!(account = %self.account, transfer = %id, peer = %to, size, "offering file");
        self.emitter.emit(EventPayload::FileTransferProgress {
            id: id.clone(),
            state: TransferState::Pending,
            progress: 0.0,
            reason: None,
        });

        self.requests.insert(iq_id, (id.clone(), Step::Offer));
        self.sids.insert(id.clone(), id.clone());
        self.active
            .insert(id.clone(), Active::new(transfer, id.clone(), None));
        self.set_state(&id, TransferState::Negotiating, None).await?;
        Ok(stanza)
    }

    /// Accept an inbound offer. The peer opens the bytestream next.
    pub async fn accept(&mut self, id: &str) -> Result<Stanza, TransferError> {
        let (peer, offer_iq) = self.pending_offer(id).await?;
        let stanza = outbound::si_accept(&offer_iq, &peer)?;
        self.set_state(id, TransferState::Negotiating, None).await?;
        Ok(stanza)
    }

    pub async fn reject(&mut self, id: &str) -> Result<Stanza, TransferError> {
        let (peer, offer_iq) = self.pending_offer(id).await?;
        let peer = outbound::parse_jid(&peer)?;
        let stanza = outbound::iq_error(&offer_iq, Some(&peer), "forbidden")?;
        self.set_state(id, TransferState::Failed, Some("rejected".into()))
            .await?;
        Ok(stanza)
    }

    /// Cancel a `Pending` or `Transferring` transfer. Returns the stanza
    /// telling the peer, if there is one to send.
    pub async fn cancel(&mut self, id: &str) -> Result<Option<Stanza>, TransferError> {
        self.require_state(id, &[TransferState::Pending, TransferState::Transferring])
            .await?;
        let Some(active) = self.active.get_mut(id) else {
            return Err(TransferError::UnknownTransfer(id.to_string()));
        };

        let stanza = match (active.transfer.state, &active.offer_iq) {
            (TransferState::Pending, Some(offer_iq)) => {
                let peer = outbound::parse_jid(&active.transfer.peer)?;
                Some(outbound::iq_error(offer_iq, Some(&peer), "forbidden")?)
            }
            (TransferState::Transferring, _) => {
                let iq_id = new_iq_id();
                let stanza = outbound::ibb_close(&iq_id, &active.transfer.peer, &active.sid)?;
                self.requests.insert(iq_id, (id.to_string(), Step::Close));
                Some(stanza)
            }
            _ => None,
        };

        if active.transfer.direction == TransferDirection::Inbound {
            active.file = None;
            remove_partial(&active.part_path()).await;
        }
        self.set_state(id, TransferState::Cancelled, None).await?;
        Ok(stanza)
    }

    // ── Inbound ────────────────────────────────────────────────────

    /// Handle an offer or bytestream request from a peer. Returns the
    /// replies to send.
    pub async fn handle_request(&mut self, iq: &Iq) -> Result<Vec<Stanza>, TransferError> {
        let Iq::Set {
            from, id, payload, ..
        } = iq
        else {
            return Err(ProtocolError::Unexpected("transfer request is not a set".into()).into());
        };

        if payload.is("si", NS_SI) {
            return self.offered(from.as_ref(), id, payload).await;
        }

        let request = match parse_ibb(payload) {
            Ok(request) => request,
            Err(error) => {
                warn!(account = %self.account, %error, "malformed bytestream request");
                return Ok(vec![outbound::iq_error(id, from.as_ref(), "bad-request")?]);
            }
        };
        let peer = from.as_ref().map(ToString::to_string).unwrap_or_default();
        let sid = request.sid().to_string();
        let outcome = match request {
            IbbRequest::Open { sid, block_size } => {
                self.bytestream_opened(&peer, &sid, block_size).await
            }
            IbbRequest::Data { sid, seq, data } => {
                self.block_received(&peer, &sid, seq, &data).await
            }
            IbbRequest::Close { sid } => self.bytestream_closed(&peer, &sid).await,
        };
        let reply = match outcome {
            Ok(reply) => reply,
            Err(TransferError::Io(error)) => {
                self.abort_inbound(&peer, &sid, &error).await?;
                Err("internal-server-error")
            }
            Err(error) => return Err(error),
        };
        let stanza = match reply {
            Ok(()) => outbound::iq_result(id, from.clone()),
            Err(condition) => outbound::iq_error(id, from.as_ref(), condition)?,
        };
        Ok(vec![stanza])
    }

    /// Whether `iq_id` is one of our transfer requests.
    pub fn owns_response(&self, iq_id: &str) -> bool {
        self.requests.contains_key(iq_id)
    }

    /// Advance the transfer a response belongs to. Returns what to send
    /// next.
    pub async fn handle_response(
        &mut self,
        response: &IqResponse,
    ) -> Result<Vec<Stanza>, TransferError> {
        let Some((id, step)) = self.requests.remove(&response.id) else {
            return Ok(Vec::new());
        };
        if step == Step::Close {
            debug!(account = %self.account, transfer = %id, "bytestream close acknowledged");
            return Ok(Vec::new());
        }
        if !self.active.contains_key(&id) {
            info!(account = %self.account, transfer = %id, ?step, "signal for finished transfer ignored");
            return Ok(Vec::new());
        }

        if let Err(condition) = &response.result {
            let reason = match step {
                Step::Offer => format!("rejected by peer: {condition}"),
                _ => format!("peer error: {condition}"),
            };
            self.set_state(&id, TransferState::Failed, Some(reason))
                .await?;
            return Ok(Vec::new());
        }

        let advanced = match step {
            Step::Offer => self.offer_accepted(&id),
            Step::Open => self.stream_opened(&id).await,
            Step::Data => self.block_acknowledged(&id).await,
            Step::Close => Ok(Vec::new()),
        };
        match advanced {
            Err(TransferError::Io(error)) => {
                warn!(account = %self.account, transfer = %id, %error, "reading source file failed");
                self.set_state(&id, TransferState::Failed, Some(error.to_string()))
                    .await?;
                Err(TransferError::Io(error))
            }
            other => other,
        }
    }

    // ── Deadlines and teardown ─────────────────────────────────────

    /// Earliest negotiation deadline among live transfers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active
            .values()
            .filter_map(|active| active.deadline)
            .min()
    }

    /// Fail every transfer still negotiating past its deadline. Returns
    /// their ids.
    pub async fn expire_negotiations(&mut self, now: Instant) -> Result<Vec<String>, TransferError> {
        let expired: Vec<String> = self
            .active
            .values()
            .filter(|active| active.transfer.state == TransferState::Negotiating)
            .filter(|active| active.deadline.is_some_and(|deadline| deadline <= now))
            .map(|active| active.transfer.id.clone())
            .collect();
        for id in &expired {
            warn!(account = %self.account, transfer = %id, "transfer negotiation timed out");
            self.set_state(id, TransferState::Failed, Some("negotiation timed out".into()))
                .await?;
        }
        Ok(expired)
    }

    /// Fail every live transfer, e.g. when the session closes.
    pub async fn fail_all(&mut self, reason: &str) -> Result<(), TransferError> {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        for id in ids {
            if let Some(active) = self.active.get_mut(&id) {
                if active.transfer.direction == TransferDirection::Inbound && active.file.take().is_some() {
                    remove_partial(&active.part_path()).await;
                }
            }
            self.set_state(&id, TransferState::Failed, Some(reason.to_string()))
                .await?;
        }
        self.requests.clear();
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn transfers(&self) -> Result<Vec<FileTransfer>, TransferError> {
        let rows: Vec<TransferRow> = self
            .db
            .query(
                &format!(
                    "SELECT {TRANSFER_COLUMNS} FROM file_transfers WHERE account = ?1 \
                     ORDER BY created_at, rowid"
                ),
                &[&self.account],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    pub async fn transfer(&self, id: &str) -> Result<FileTransfer, TransferError> {
        let row: Result<TransferRow, StorageError> = self
            .db
            .query_one(
                &format!("SELECT {TRANSFER_COLUMNS} FROM file_transfers WHERE account = ?1 AND id = ?2"),
                &[&self.account, &id],
            )
            .await;
        match row {
            Ok(row) => Ok(row.0),
            Err(StorageError::NotFound) => Err(TransferError::UnknownTransfer(id.to_string())),
            Err(error) => Err(error.into()),
        }
    }

    // ── Outbound steps ─────────────────────────────────────────────

    fn offer_accepted(&mut self, id: &str) -> Result<Vec<Stanza>, TransferError> {
        let Some(active) = self.active.get(id) else {
            return Ok(Vec::new());
        };
        let iq_id = new_iq_id();
        let stanza = outbound::ibb_open(
            &iq_id,
            &active.transfer.peer,
            &active.sid,
            self.config.block_size.max(1),
        )?;
        debug!(account = %self.account, transfer = %id, "offer accepted, opening bytestream");
        self.requests.insert(iq_id, (id.to_string(), Step::Open));
        Ok(vec![stanza])
    }

    async fn stream_opened(&mut self, id: &str) -> Result<Vec<Stanza>, TransferError> {
        let Some(active) = self.active.get_mut(id) else {
            return Ok(Vec::new());
        };
        active.file = Some(File::open(&active.transfer.local_path).await?);
        self.set_state(id, TransferState::Transferring, None).await?;
        self.next_block(id).await
    }

    async fn block_acknowledged(&mut self, id: &str) -> Result<Vec<Stanza>, TransferError> {
        if let Some(active) = self.active.get_mut(id) {
            active.bytes += active.in_flight;
            active.in_flight = 0;
        }
        self.record_progress(id).await?;
        self.next_block(id).await
    }

    /// Send the next block, or close the stream once everything is
    /// acknowledged.
    async fn next_block(&mut self, id: &str) -> Result<Vec<Stanza>, TransferError> {
        let block_size = u64::from(self.config.block_size.max(1));
        let Some(active) = self.active.get_mut(id) else {
            return Ok(Vec::new());
        };
        let peer = active.transfer.peer.clone();
        let sid = active.sid.clone();

        if active.bytes >= active.transfer.size {
            active.file = None;
            let iq_id = new_iq_id();
            let stanza = outbound::ibb_close(&iq_id, &peer, &sid)?;
            self.requests.insert(iq_id, (id.to_string(), Step::Close));
            self.set_state(id, TransferState::Completed, None).await?;
            return Ok(vec![stanza]);
        }

        let file = active
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("source file is not open"))?;
        let mut block = Vec::with_capacity(block_size as usize);
        file.take(block_size).read_to_end(&mut block).await?;
        if block.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source file shrank").into());
        }

        let seq = active.seq;
        active.seq = seq.wrapping_add(1);
        active.in_flight = block.len() as u64;
        let iq_id = new_iq_id();
        let stanza = outbound::ibb_data(&iq_id, &peer, &sid, seq, &block)?;
        self.requests.insert(iq_id, (id.to_string(), Step::Data));
        Ok(vec![stanza])
    }

    // ── Inbound steps ──────────────────────────────────────────────

    async fn offered(
        &mut self,
        from: Option<&Jid>,
        iq_id: &str,
        payload: &Element,
    ) -> Result<Vec<Stanza>, TransferError> {
        let peer = from
            .map(ToString::to_string)
            .ok_or_else(|| ProtocolError::Unexpected("file offer without sender".into()))?;
        let offer = match parse_offer(payload) {
            Ok(offer) => offer,
            Err(error) => {
                warn!(account = %self.account, %peer, %error, "malformed file offer");
                return Ok(vec![outbound::iq_error(iq_id, from, "bad-request")?]);
            }
        };
        if !offer.offers_ibb {
            info!(account = %self.account, %peer, "file offer without in-band bytestreams declined");
            return Ok(vec![outbound::iq_error(iq_id, from, "bad-request")?]);
        }

        let id = new_transfer_id();
        let local_path = self.config.download_dir().join(&offer.filename);
        let transfer = FileTransfer {
            id: id.clone(),
            direction: TransferDirection::Inbound,
            peer: peer.clone(),
            filename: offer.filename.clone(),
            size: offer.size,
            mime_type: offer.mime_type.clone(),
            local_path: local_path.display().to_string(),
            state: TransferState::Pending,
            progress: 0.0,
            error: None,
        };
        self.insert(&transfer).await?;
        info!(account = %self.account, transfer = %id, %peer, file = %offer.filename, size = offer.size, "file offered");
        self.emitter.emit(EventPayload::FileTransferOffered {
            transfer: transfer.clone(),
        });
        self.sids.insert(offer.sid.clone(), id.clone());
        self.active.insert(
            id.clone(),
            Active::new(transfer, offer.sid, Some(iq_id.to_string())),
        );

        if offer.size > self.config.max_file_size {
            let stanza = outbound::iq_error(iq_id, from, "not-acceptable")?;
            self.set_state(&id, TransferState::Failed, Some("exceeds size limit".into()))
                .await?;
            return Ok(vec![stanza]);
        }
        Ok(Vec::new())
    }

    /// The live inbound transfer using `sid` with `peer`.
    fn inbound_for(&self, peer: &str, sid: &str) -> Option<String> {
        let id = self.sids.get(sid)?;
        self.active
            .get(id)
            .filter(|active| active.transfer.direction == TransferDirection::Inbound)
            .filter(|active| active.transfer.peer == peer)
            .map(|active| active.transfer.id.clone())
    }

    async fn bytestream_opened(
        &mut self,
        peer: &str,
        sid: &str,
        block_size: u32,
    ) -> Result<Result<(), &'static str>, TransferError> {
        let Some(id) = self.inbound_for(peer, sid) else {
            return Ok(Err("item-not-found"));
        };
        let Some(active) = self.active.get_mut(&id) else {
            return Ok(Err("item-not-found"));
        };
        if active.transfer.state != TransferState::Negotiating || block_size == 0 {
            return Ok(Err("not-acceptable"));
        }
        let part = active.part_path();
        if let Some(dir) = part.parent() {
            fs::create_dir_all(dir).await?;
        }
        active.file = Some(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&part)
                .await?,
        );
        self.set_state(&id, TransferState::Transferring, None).await?;
        Ok(Ok(()))
    }

    async fn block_received(
        &mut self,
        peer: &str,
        sid: &str,
        seq: u16,
        data: &[u8],
    ) -> Result<Result<(), &'static str>, TransferError> {
        let Some(id) = self.inbound_for(peer, sid) else {
            return Ok(Err("item-not-found"));
        };
        let Some(active) = self.active.get_mut(&id) else {
            return Ok(Err("item-not-found"));
        };
        if active.transfer.state != TransferState::Transferring {
            return Ok(Err("unexpected-request"));
        }

        let failure = if seq != active.seq {
            Some(format!("out-of-order block {seq}, expected {}", active.seq))
        } else if active.bytes + data.len() as u64 > active.transfer.size {
            Some("more data than offered".to_string())
        } else {
            None
        };
        if let Some(reason) = failure {
            warn!(account = %self.account, transfer = %id, %reason, "inbound transfer failed");
            active.file = None;
            remove_partial(&active.part_path()).await;
            self.set_state(&id, TransferState::Failed, Some(reason))
                .await?;
            return Ok(Err("unexpected-request"));
        }

        let Some(file) = active.file.as_mut() else {
            return Ok(Err("unexpected-request"));
        };
        file.write_all(data).await?;
        active.bytes += data.len() as u64;
        active.seq = seq.wrapping_add(1);
        self.record_progress(&id).await?;
        Ok(Ok(()))
    }

    /// Fail the inbound transfer on `sid` after a local file error.
    async fn abort_inbound(&mut self, peer: &str, sid: &str, error: &io::Error) -> Result<(), TransferError> {
        let Some(id) = self.inbound_for(peer, sid) else {
            return Ok(());
        };
        warn!(account = %self.account, transfer = %id, %error, "writing download failed");
        if let Some(active) = self.active.get_mut(&id) {
            active.file = None;
            remove_partial(&active.part_path()).await;
        }
        self.set_state(&id, TransferState::Failed, Some(format!("file error: {error}")))
            .await
    }

    async fn bytestream_closed(
        &mut self,
        peer: &str,
        sid: &str,
    ) -> Result<Result<(), &'static str>, TransferError> {
        let Some(id) = self.inbound_for(peer, sid) else {
            return Ok(Err("item-not-found"));
        };
        let Some(active) = self.active.get_mut(&id) else {
            return Ok(Err("item-not-found"));
        };
        if active.transfer.state != TransferState::Transferring {
            return Ok(Err("unexpected-request"));
        }
        let Some(mut file) = active.file.take() else {
            return Ok(Err("unexpected-request"));
        };
        file.flush().await?;
        drop(file);

        let part = active.part_path();
        if active.bytes != active.transfer.size {
            let reason = format!(
                "size mismatch: received {} of {} bytes",
                active.bytes, active.transfer.size
            );
            remove_partial(&part).await;
            self.set_state(&id, TransferState::Failed, Some(reason))
                .await?;
            return Ok(Ok(()));
        }

        let target = unused_path(Path::new(&active.transfer.local_path)).await;
        fs::rename(&part, &target).await?;
        let target = target.display().to_string();
        if target != active.transfer.local_path {
            active.transfer.local_path = target.clone();
            self.db
                .execute(
                    "UPDATE file_transfers SET local_path = ?3 WHERE account = ?1 AND id = ?2",
                    &[&self.account, &id, &target],
                )
                .await?;
        }
        self.set_state(&id, TransferState::Completed, None).await?;
        Ok(Ok(()))
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn insert(&self, transfer: &FileTransfer) -> Result<(), TransferError> {
        let now = Utc::now();
        self.db
            .execute(
                "INSERT INTO file_transfers (id, account, direction, peer_jid, filename, size, \
                 mime_type, local_path, state, progress, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                &[
                    &transfer.id,
                    &self.account,
                    &transfer.direction.as_str(),
                    &transfer.peer,
                    &transfer.filename,
                    &transfer.size,
                    &transfer.mime_type,
                    &transfer.local_path,
                    &transfer.state.as_str(),
                    &transfer.progress,
                    &now,
                ],
            )
            .await?;
        Ok(())
    }

    async fn pending_offer(&self, id: &str) -> Result<(String, String), TransferError> {
        self.require_state(id, &[TransferState::Pending]).await?;
        self.active
            .get(id)
            .and_then(|active| {
                active
                    .offer_iq
                    .clone()
                    .map(|offer_iq| (active.transfer.peer.clone(), offer_iq))
            })
            .ok_or_else(|| TransferError::InvalidState {
                id: id.to_string(),
                state: TransferState::Pending,
            })
    }

    async fn require_state(&self, id: &str, allowed: &[TransferState]) -> Result<(), TransferError> {
        let state = match self.active.get(id) {
            Some(active) => active.transfer.state,
            None => self.transfer(id).await?.state,
        };
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(TransferError::InvalidState {
                id: id.to_string(),
                state,
            })
        }
    }

    /// Move a live transfer to `state`, persist it and announce it. Terminal
    /// states retire the transfer.
    async fn set_state(
        &mut self,
        id: &str,
        state: TransferState,
        reason: Option<String>,
    ) -> Result<(), TransferError> {
        let Some(active) = self.active.get_mut(id) else {
            debug!(account = %self.account, transfer = %id, ?state, "state change for finished transfer ignored");
            return Ok(());
        };
        let now = Instant::now();
        active.transfer.state = state;
        active.transfer.progress = if state == TransferState::Completed {
            1.0
        } else {
            active.progress()
        };
        active.transfer.error = reason.clone();
        active.deadline = (state == TransferState::Negotiating).then(|| now + self.negotiation_timeout);
        active.last_report = Some(now);
        let progress = active.transfer.progress;
        let bytes = active.bytes;

        self.db
            .execute(
                "UPDATE file_transfers SET state = ?3, progress = ?4, bytes_transferred = ?5, \
                 error = ?6, updated_at = ?7 WHERE account = ?1 AND id = ?2",
                &[
                    &self.account,
                    &id,
                    &state.as_str(),
                    &progress,
                    &bytes,
                    &reason,
                    &Utc::now(),
                ],
            )
            .await?;
        info!(account = %self.account, transfer = %id, state = state.as_str(), "transfer state changed");
        self.emitter.emit(EventPayload::FileTransferProgress {
            id: id.to_string(),
            state,
            progress,
            reason,
        });

        if state.is_terminal() {
            if let Some(active) = self.active.remove(id) {
                self.sids.remove(&active.sid);
            }
        }
        Ok(())
    }

    /// Store the current progress. Events are coalesced per
    /// `progress_interval`.
    async fn record_progress(&mut self, id: &str) -> Result<(), TransferError> {
        let interval = self.config.progress_interval();
        let Some(active) = self.active.get_mut(id) else {
            return Ok(());
        };
        let progress = active.progress();
        active.transfer.progress = progress;
        let now = Instant::now();
        let due = active
            .last_report
            .is_none_or(|last| now.duration_since(last) >= interval);
        if due {
            active.last_report = Some(now);
        }
        let bytes = active.bytes;
        let state = active.transfer.state;

        self.db
            .execute(
                "UPDATE file_transfers SET progress = ?3, bytes_transferred = ?4, updated_at = ?5 \
                 WHERE account = ?1 AND id = ?2",
                &[&self.account, &id, &progress, &bytes, &Utc::now()],
            )
            .await?;
        if due {
            self.emitter.emit(EventPayload::FileTransferProgress {
                id: id.to_string(),
                state,
                progress,
                reason: None,
            });
        }
        Ok(())
    }
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "partial download removed"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "could not remove partial download"),
    }
}

/// `path`, or `name (n).ext` beside it when `path` is taken.
async fn unused_path(path: &Path) -> PathBuf {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("download");
    let extension = path.extension().and_then(|ext| ext.to_str());
    for n in 1u32.. {
        let name = match extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = path.with_file_name(name);
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
    }
    path.to_path_buf()
}
