//! Volume lifecycle and checkpoint engine
//!
//! A [`Volume`] owns three B+Tree maps (inode records, log-segment
//! records, B+Tree-node objects) and moves them between two durable
//! states: **checkpointed** (fully described in the object store, anchored
//! by the container checkpoint header) and **advanced** (checkpointed
//! state plus the transactions in the local replay log).
//!
//! The volume is single-writer: one mutex serializes every
//! externally-visible operation, and the checkpoint daemon is the only
//! task that runs [`Volume::put_checkpoint`], holding that mutex for the
//! duration. Only the garbage-collection deletes escape the lock, spawned
//! as detached tasks whose completion the next checkpoint awaits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::btree::{BPlusTree, NodeIo, NodeLocation};
use crate::checkpoint::{
    encode_layouts, object_name, CheckpointHeader, CheckpointTrailer, BI_MODAL_HEADER_NAME,
    CHECKPOINT_HEADER_NAME, STORAGE_POLICY_HEADER_NAME,
};
use crate::daemon::{self, CheckpointRequest};
use crate::object_store::{ChunkedPutContext, Headers, ObjectClient};
use crate::replay::{ReplayLog, Transaction};
use metafs_core::{Error, Result, VolumeConfig};

/// The three B+Tree maps a volume owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Inode records, keyed by inode number.
    InodeRec,
    /// Log-segment records, keyed by segment number.
    LogSegmentRec,
    /// B+Tree-node objects, keyed by object number.
    BPlusTreeObject,
}

impl TreeKind {
    /// Stable name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InodeRec => "inode_rec",
            Self::LogSegmentRec => "log_segment_rec",
            Self::BPlusTreeObject => "b_plus_tree_object",
        }
    }
}

struct TreeWrapper {
    kind: TreeKind,
    tree: BPlusTree,
    /// Bytes referenced per checkpoint object by this tree's live nodes,
    /// credited on every node write and debited on every discard.
    layout: HashMap<u64, u64>,
}

struct OpenChunkedPut {
    object_number: u64,
    ctx: Box<dyn ChunkedPutContext>,
}

pub(crate) struct VolumeState {
    header: CheckpointHeader,
    trailer: CheckpointTrailer,
    inode_rec: TreeWrapper,
    log_segment_rec: TreeWrapper,
    b_plus_tree_object: TreeWrapper,
    /// The shared chunked-PUT context tree flushes write through; at most
    /// one is open per volume.
    checkpoint_put: Option<OpenChunkedPut>,
    replay_log: Option<ReplayLog>,
    next_nonce: u64,
    checkpoint_flushed_data: bool,
    pending_deletes: Vec<JoinHandle<()>>,
    pub(crate) next_checkpoint_waiters: Vec<oneshot::Sender<()>>,
    pub(crate) failed: bool,
}

impl VolumeState {
    fn wrapper_mut(&mut self, kind: TreeKind) -> &mut TreeWrapper {
        match kind {
            TreeKind::InodeRec => &mut self.inode_rec,
            TreeKind::LogSegmentRec => &mut self.log_segment_rec,
            TreeKind::BPlusTreeObject => &mut self.b_plus_tree_object,
        }
    }

    fn wrapper(&self, kind: TreeKind) -> &TreeWrapper {
        match kind {
            TreeKind::InodeRec => &self.inode_rec,
            TreeKind::LogSegmentRec => &self.log_segment_rec,
            TreeKind::BPlusTreeObject => &self.b_plus_tree_object,
        }
    }
}

/// A mounted volume.
pub struct Volume {
    config: VolumeConfig,
    client: Arc<dyn ObjectClient>,
    pub(crate) state: Mutex<VolumeState>,
    request_tx: mpsc::Sender<CheckpointRequest>,
    daemon: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Volume {
    /// Bring a volume up.
    ///
    /// Reads (or, with `auto_format`, seeds) the checkpoint header, loads
    /// the trailer and layout reports, reopens the three trees, replays
    /// the local replay log, and starts the checkpoint daemon.
    ///
    /// # Errors
    ///
    /// Startup errors are returned to the caller: a missing container
    /// without `auto_format`, a malformed or unsupported header, a
    /// corrupt trailer, or replay-log I/O failures.
    pub async fn up(
        client: Arc<dyn ObjectClient>,
        config: VolumeConfig,
        auto_format: bool,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| Error::ValidationError(e.to_string()))?;
        let account = &config.account_name;
        let container = &config.checkpoint_container;

        let header = match client.container_head(account, container).await {
            Ok(headers) => {
                let value = headers.get(CHECKPOINT_HEADER_NAME).ok_or_else(|| {
                    Error::Parse(format!(
                        "container `{container}` carries no checkpoint header"
                    ))
                })?;
                CheckpointHeader::parse(value)?
            }
            Err(Error::NotFound { .. }) if auto_format => {
                tracing::info!(%account, %container, "checkpoint container absent; formatting");
                let mut put_headers = Headers::new();
                put_headers.insert(
                    STORAGE_POLICY_HEADER_NAME.to_string(),
                    config.storage_policy.clone(),
                );
                client.container_put(account, container, put_headers).await?;

                let mut account_headers = Headers::new();
                account_headers.insert(BI_MODAL_HEADER_NAME.to_string(), "true".to_string());
                client.account_post(account, account_headers).await?;

                let header = CheckpointHeader::formatted(config.first_nonce);
                post_checkpoint_header(client.as_ref(), account, container, &header).await?;
                header
            }
            Err(e) => return Err(e),
        };

        let (trailer, layouts) = if header.object_number == 0 {
            (
                CheckpointTrailer::default(),
                [HashMap::new(), HashMap::new(), HashMap::new()],
            )
        } else {
            let name = object_name(header.object_number);
            let buf = client
                .object_tail(account, container, &name, header.object_length)
                .await?;
            CheckpointTrailer::decode(&buf)?
        };

        let open_tree = |root: NodeLocation| {
            if root.object_number == 0 {
                BPlusTree::new(config.leaf_fanout, config.leaf_cache_capacity)
            } else {
                BPlusTree::open(root, config.leaf_fanout, config.leaf_cache_capacity)
            }
        };
        let [inode_layout, segment_layout, object_layout] = layouts;
        let mut state = VolumeState {
            header,
            trailer,
            inode_rec: TreeWrapper {
                kind: TreeKind::InodeRec,
                tree: open_tree(trailer.inode_rec_root),
                layout: inode_layout,
            },
            log_segment_rec: TreeWrapper {
                kind: TreeKind::LogSegmentRec,
                tree: open_tree(trailer.log_segment_rec_root),
                layout: segment_layout,
            },
            b_plus_tree_object: TreeWrapper {
                kind: TreeKind::BPlusTreeObject,
                tree: open_tree(trailer.b_plus_tree_object_root),
                layout: object_layout,
            },
            checkpoint_put: None,
            replay_log: config.replay_log_path.clone().map(ReplayLog::new),
            next_nonce: header.reserved_to_nonce,
            checkpoint_flushed_data: false,
            pending_deletes: Vec::new(),
            next_checkpoint_waiters: Vec::new(),
            failed: false,
        };

        let replayed = match state.replay_log.as_mut() {
            Some(log) => log.open_and_scan(header.object_number)?,
            None => Vec::new(),
        };
        if !replayed.is_empty() {
            tracing::info!(
                count = replayed.len(),
                "replaying transactions recorded since the last checkpoint"
            );
        }
        for transaction in replayed {
            Self::apply_transaction(&mut state, &client, &config, transaction).await?;
        }

        let (request_tx, request_rx) = mpsc::channel(8);
        let volume = Arc::new(Self {
            config,
            client,
            state: Mutex::new(state),
            request_tx,
            daemon: parking_lot::Mutex::new(None),
        });
        let handle = tokio::spawn(daemon::run(Arc::clone(&volume), request_rx));
        *volume.daemon.lock() = Some(handle);

        tracing::info!(
            account = %volume.config.account_name,
            container = %volume.config.checkpoint_container,
            checkpoint_object = header.object_number,
            "volume up"
        );
        Ok(volume)
    }

    /// Bring the volume down: run one final checkpoint and stop the
    /// daemon.
    pub async fn down(&self) -> Result<()> {
        let result = self.request_checkpoint(true).await;
        let handle = self.daemon.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        result
    }

    /// Run one checkpoint now and wait for it.
    pub async fn checkpoint(&self) -> Result<()> {
        self.request_checkpoint(false).await
    }

    /// Resolve once the next checkpoint (whoever requests it) completes.
    pub async fn next_checkpoint_done(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            self.check_live(&state)?;
            state.next_checkpoint_waiters.push(tx);
        }
        rx.await.map_err(|_| Error::Halted)
    }

    /// Tear the volume down without a final checkpoint.
    ///
    /// Unflushed state stays recoverable from the replay log; supervisors
    /// use this when the volume must stop immediately.
    pub fn abort(&self) {
        if let Some(handle) = self.daemon.lock().take() {
            handle.abort();
        }
    }

    /// The volume's configuration.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    async fn request_checkpoint(&self, exit_on_completion: bool) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.request_tx
            .send(CheckpointRequest {
                exit_on_completion,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| Error::Halted)?;
        done_rx.await.map_err(|_| Error::Halted)?
    }

    fn check_live(&self, state: &VolumeState) -> Result<()> {
        if state.failed {
            return Err(Error::Halted);
        }
        Ok(())
    }

    /// Allocate a never-reused nonce, durably extending the header's
    /// reservation before handing out a value past it.
    pub async fn fetch_nonce(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.check_live(&state)?;
        let state = &mut *state;
        reserve_and_fetch(
            self.client.as_ref(),
            &self.config.account_name,
            &self.config.checkpoint_container,
            &mut state.header,
            &mut state.next_nonce,
            self.config.nonce_values_to_reserve,
        )
        .await
    }

    /// Insert or update one inode record.
    pub async fn put_inode_rec(&self, inode_number: u64, value: Bytes) -> Result<()> {
        self.record(Transaction::PutInodeRec {
            inode_number,
            value,
        })
        .await
    }

    /// Insert or update a batch of inode records under one log record.
    pub async fn put_inode_recs(&self, recs: Vec<(u64, Bytes)>) -> Result<()> {
        self.record(Transaction::PutInodeRecs { recs }).await
    }

    /// Delete one inode record.
    pub async fn delete_inode_rec(&self, inode_number: u64) -> Result<()> {
        self.record(Transaction::DeleteInodeRec { inode_number })
            .await
    }

    /// Insert or update one log-segment record.
    pub async fn put_log_segment_rec(&self, segment_number: u64, value: Bytes) -> Result<()> {
        self.record(Transaction::PutLogSegmentRec {
            segment_number,
            value,
        })
        .await
    }

    /// Delete one log-segment record.
    pub async fn delete_log_segment_rec(&self, segment_number: u64) -> Result<()> {
        self.record(Transaction::DeleteLogSegmentRec { segment_number })
            .await
    }

    /// Insert or update one B+Tree-object record.
    pub async fn put_b_plus_tree_object(&self, object_number: u64, value: Bytes) -> Result<()> {
        self.record(Transaction::PutBPlusTreeObject {
            object_number,
            value,
        })
        .await
    }

    /// Delete one B+Tree-object record.
    pub async fn delete_b_plus_tree_object(&self, object_number: u64) -> Result<()> {
        self.record(Transaction::DeleteBPlusTreeObject { object_number })
            .await
    }

    /// Fetch one inode record.
    pub async fn get_inode_rec(&self, inode_number: u64) -> Result<Option<Bytes>> {
        self.get_record(TreeKind::InodeRec, inode_number).await
    }

    /// Fetch one log-segment record.
    pub async fn get_log_segment_rec(&self, segment_number: u64) -> Result<Option<Bytes>> {
        self.get_record(TreeKind::LogSegmentRec, segment_number)
            .await
    }

    /// Fetch one B+Tree-object record.
    pub async fn get_b_plus_tree_object(&self, object_number: u64) -> Result<Option<Bytes>> {
        self.get_record(TreeKind::BPlusTreeObject, object_number)
            .await
    }

    /// Number of entries in one tree.
    pub async fn tree_len(&self, kind: TreeKind) -> Result<u64> {
        let state = self.state.lock().await;
        self.check_live(&state)?;
        Ok(state.wrapper(kind).tree.len())
    }

    /// The trailer of the current checkpoint; synthetic zeros before the
    /// first checkpoint is written.
    pub async fn checkpoint_trailer(&self) -> Result<CheckpointTrailer> {
        let state = self.state.lock().await;
        self.check_live(&state)?;
        Ok(state.trailer)
    }

    /// Snapshot of one tree's layout report.
    pub async fn layout_report(&self, kind: TreeKind) -> Result<HashMap<u64, u64>> {
        let state = self.state.lock().await;
        self.check_live(&state)?;
        Ok(state.wrapper(kind).layout.clone())
    }

    /// Cross-check the incrementally-maintained layout reports against a
    /// recomputation from the live node locations.
    pub async fn validate_layouts(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_live(&state)?;
        let state = &mut *state;
        for wrapper in [
            &mut state.inode_rec,
            &mut state.log_segment_rec,
            &mut state.b_plus_tree_object,
        ] {
            let TreeWrapper { kind, tree, layout } = wrapper;
            let computed = {
                let mut io = TreeIo::reader(self.client.as_ref(), &self.config, layout);
                tree.layout_report(&mut io).await?
            };
            let tracked: HashMap<u64, u64> = layout
                .iter()
                .filter(|(_, &bytes)| bytes > 0)
                .map(|(&object, &bytes)| (object, bytes))
                .collect();
            if computed != tracked {
                return Err(Error::corrupt(format!(
                    "{} layout diverged: tracked {tracked:?}, recomputed {computed:?}",
                    kind.as_str()
                )));
            }
        }
        Ok(())
    }

    async fn record(&self, transaction: Transaction) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_live(&state)?;
        tracing::debug!(
            transaction = transaction.transaction_type().name(),
            "recording transaction"
        );

        let fence = state.header.object_number;
        if let Some(log) = state.replay_log.as_mut() {
            if let Err(err) = log.append(&transaction, fence) {
                return Err(self.fail(&mut state, err));
            }
        }
        if let Err(err) =
            Self::apply_transaction(&mut state, &self.client, &self.config, transaction).await
        {
            return Err(self.fail(&mut state, err));
        }
        Ok(())
    }

    async fn get_record(&self, kind: TreeKind, key: u64) -> Result<Option<Bytes>> {
        let mut state = self.state.lock().await;
        self.check_live(&state)?;
        let TreeWrapper { tree, layout, .. } = state.wrapper_mut(kind);
        let mut io = TreeIo::reader(self.client.as_ref(), &self.config, layout);
        tree.get(key, &mut io).await
    }

    /// The replay log is the only durable record of recent changes, and a
    /// half-applied mutation has no rollback path: poison the volume (or
    /// halt outright, per configuration).
    fn fail(&self, state: &mut VolumeState, err: Error) -> Error {
        tracing::error!(error = %err, "fatal volume error; rejecting further operations");
        state.failed = true;
        if self.config.halt_on_fatal_error {
            std::process::abort();
        }
        err
    }

    async fn apply_transaction(
        state: &mut VolumeState,
        client: &Arc<dyn ObjectClient>,
        config: &VolumeConfig,
        transaction: Transaction,
    ) -> Result<()> {
        match transaction {
            Transaction::PutInodeRec {
                inode_number,
                value,
            } => Self::upsert(&mut state.inode_rec, client, config, inode_number, value).await,
            Transaction::PutInodeRecs { recs } => {
                for (inode_number, value) in recs {
                    Self::upsert(&mut state.inode_rec, client, config, inode_number, value)
                        .await?;
                }
                Ok(())
            }
            Transaction::DeleteInodeRec { inode_number } => {
                Self::remove(&mut state.inode_rec, client, config, inode_number).await
            }
            Transaction::PutLogSegmentRec {
                segment_number,
                value,
            } => {
                Self::upsert(
                    &mut state.log_segment_rec,
                    client,
                    config,
                    segment_number,
                    value,
                )
                .await
            }
            Transaction::DeleteLogSegmentRec { segment_number } => {
                Self::remove(&mut state.log_segment_rec, client, config, segment_number).await
            }
            Transaction::PutBPlusTreeObject {
                object_number,
                value,
            } => {
                Self::upsert(
                    &mut state.b_plus_tree_object,
                    client,
                    config,
                    object_number,
                    value,
                )
                .await
            }
            Transaction::DeleteBPlusTreeObject { object_number } => {
                Self::remove(&mut state.b_plus_tree_object, client, config, object_number).await
            }
        }
    }

    async fn upsert(
        wrapper: &mut TreeWrapper,
        client: &Arc<dyn ObjectClient>,
        config: &VolumeConfig,
        key: u64,
        value: Bytes,
    ) -> Result<()> {
        let TreeWrapper { tree, layout, .. } = wrapper;
        let mut io = TreeIo::reader(client.as_ref(), config, layout);
        if !tree.patch_by_key(key, value.clone(), &mut io).await? {
            tree.put(key, value, &mut io).await?;
        }
        Ok(())
    }

    async fn remove(
        wrapper: &mut TreeWrapper,
        client: &Arc<dyn ObjectClient>,
        config: &VolumeConfig,
        key: u64,
    ) -> Result<()> {
        let TreeWrapper { tree, layout, .. } = wrapper;
        let mut io = TreeIo::reader(client.as_ref(), config, layout);
        tree.delete_by_key(key, &mut io).await?;
        Ok(())
    }

    /// Write a checkpoint. Runs only on the daemon task, under the volume
    /// lock; any error here is fatal to the volume.
    pub(crate) async fn put_checkpoint(&self, state: &mut VolumeState) -> Result<()> {
        // Let the previous checkpoint's deletes finish so their completion
        // is observable from here on.
        for handle in state.pending_deletes.drain(..) {
            let _ = handle.await;
        }

        state.checkpoint_flushed_data = false;
        let config = &self.config;
        let state = &mut *state;

        let mut roots = [NodeLocation::default(); 3];
        {
            let VolumeState {
                header,
                inode_rec,
                log_segment_rec,
                b_plus_tree_object,
                checkpoint_put,
                next_nonce,
                checkpoint_flushed_data,
                ..
            } = state;
            let trees: [&mut TreeWrapper; 3] = [inode_rec, log_segment_rec, b_plus_tree_object];
            for (wrapper, root) in trees.into_iter().zip(roots.iter_mut()) {
                let TreeWrapper { tree, layout, .. } = wrapper;
                let sink = FlushSink {
                    put: &mut *checkpoint_put,
                    header: &mut *header,
                    next_nonce: &mut *next_nonce,
                    flushed: &mut *checkpoint_flushed_data,
                    max_flush_size: config.max_flush_size,
                    nonce_step: config.nonce_values_to_reserve,
                };
                let mut io = TreeIo::flusher(self.client.as_ref(), config, layout, sink);
                if let Some(location) = tree.flush(&mut io, false).await? {
                    *root = location;
                }
            }
        }

        if !state.checkpoint_flushed_data {
            tracing::debug!("no tree data flushed; existing checkpoint still valid");
            return Ok(());
        }

        for wrapper in [
            &mut state.inode_rec,
            &mut state.log_segment_rec,
            &mut state.b_plus_tree_object,
        ] {
            wrapper.tree.prune();
        }

        let trailer = CheckpointTrailer {
            inode_rec_root: roots[0],
            log_segment_rec_root: roots[1],
            b_plus_tree_object_root: roots[2],
            layout_counts: [
                state.inode_rec.layout.len() as u64,
                state.log_segment_rec.layout.len() as u64,
                state.b_plus_tree_object.layout.len() as u64,
            ],
        };
        let trailer_buf = trailer.encode()?;
        let layout_buf = encode_layouts([
            &state.inode_rec.layout,
            &state.log_segment_rec.layout,
            &state.b_plus_tree_object.layout,
        ])?;

        // Ship the trailer and hard-close the object: the header POST is
        // about to point readers at its tail.
        if state.checkpoint_put.is_none() {
            let nonce = reserve_and_fetch(
                self.client.as_ref(),
                &config.account_name,
                &config.checkpoint_container,
                &mut state.header,
                &mut state.next_nonce,
                config.nonce_values_to_reserve,
            )
            .await?;
            let ctx = self
                .client
                .object_chunked_put(
                    &config.account_name,
                    &config.checkpoint_container,
                    &object_name(nonce),
                )
                .await?;
            state.checkpoint_put = Some(OpenChunkedPut {
                object_number: nonce,
                ctx,
            });
        }
        let OpenChunkedPut {
            object_number,
            mut ctx,
        } = state
            .checkpoint_put
            .take()
            .ok_or_else(|| Error::internal("checkpoint chunked PUT vanished"))?;
        let trailer_beginning = ctx.bytes_put();
        ctx.send_chunk(Bytes::from(trailer_buf)).await?;
        ctx.send_chunk(Bytes::from(layout_buf)).await?;
        let trailer_ending = ctx.bytes_put();
        ctx.close().await?;

        state.header.object_number = object_number;
        state.header.object_length = trailer_ending - trailer_beginning;
        post_checkpoint_header(
            self.client.as_ref(),
            &config.account_name,
            &config.checkpoint_container,
            &state.header,
        )
        .await?;
        state.trailer = trailer;
        tracing::info!(
            object = %object_name(object_number),
            trailer_bytes = state.header.object_length,
            "checkpoint committed"
        );

        if let Some(log) = state.replay_log.as_mut() {
            log.discard()?;
        }

        // Garbage collection: anything no tree references any more is
        // garbage now that the header swap is durable.
        let mut combined: HashMap<u64, u64> = HashMap::new();
        for wrapper in [
            &state.inode_rec,
            &state.log_segment_rec,
            &state.b_plus_tree_object,
        ] {
            for (&object, &bytes) in &wrapper.layout {
                *combined.entry(object).or_insert(0) += bytes;
            }
        }
        for wrapper in [
            &mut state.inode_rec,
            &mut state.log_segment_rec,
            &mut state.b_plus_tree_object,
        ] {
            wrapper.layout.retain(|_, bytes| *bytes > 0);
        }
        for (object, bytes) in combined {
            // The current checkpoint object holds the live trailer even
            // when no tree node landed in it.
            if bytes > 0 || object == state.header.object_number {
                continue;
            }
            let client = Arc::clone(&self.client);
            let account = config.account_name.clone();
            let container = config.checkpoint_container.clone();
            let name = object_name(object);
            tracing::info!(object = %name, "deleting unreferenced checkpoint object");
            let handle = tokio::spawn(async move {
                if let Err(err) = client.object_delete(&account, &container, &name).await {
                    tracing::warn!(
                        object = %name,
                        error = %err,
                        "failed to delete unreferenced checkpoint object"
                    );
                }
            });
            state.pending_deletes.push(handle);
        }

        Ok(())
    }
}

/// Node I/O callbacks wired to one tree's layout and, during a checkpoint
/// flush, to the volume's shared chunked-PUT context.
struct TreeIo<'a> {
    client: &'a dyn ObjectClient,
    account: &'a str,
    container: &'a str,
    layout: &'a mut HashMap<u64, u64>,
    sink: Option<FlushSink<'a>>,
}

struct FlushSink<'a> {
    put: &'a mut Option<OpenChunkedPut>,
    header: &'a mut CheckpointHeader,
    next_nonce: &'a mut u64,
    flushed: &'a mut bool,
    max_flush_size: u64,
    nonce_step: u64,
}

impl<'a> TreeIo<'a> {
    fn reader(
        client: &'a dyn ObjectClient,
        config: &'a VolumeConfig,
        layout: &'a mut HashMap<u64, u64>,
    ) -> Self {
        Self {
            client,
            account: &config.account_name,
            container: &config.checkpoint_container,
            layout,
            sink: None,
        }
    }

    fn flusher(
        client: &'a dyn ObjectClient,
        config: &'a VolumeConfig,
        layout: &'a mut HashMap<u64, u64>,
        sink: FlushSink<'a>,
    ) -> Self {
        Self {
            client,
            account: &config.account_name,
            container: &config.checkpoint_container,
            layout,
            sink: Some(sink),
        }
    }
}

#[async_trait]
impl NodeIo for TreeIo<'_> {
    async fn write_node(&mut self, node: Bytes) -> Result<(u64, u64)> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| Error::invalid_state("tree node write outside a checkpoint flush"))?;

        if sink.put.is_none() {
            let nonce = reserve_and_fetch(
                self.client,
                self.account,
                self.container,
                sink.header,
                sink.next_nonce,
                sink.nonce_step,
            )
            .await?;
            let ctx = self
                .client
                .object_chunked_put(self.account, self.container, &object_name(nonce))
                .await?;
            *sink.put = Some(OpenChunkedPut {
                object_number: nonce,
                ctx,
            });
        }

        let (object_number, offset) = {
            let open = sink
                .put
                .as_mut()
                .ok_or_else(|| Error::internal("chunked PUT context vanished"))?;
            let offset = open.ctx.bytes_put();
            open.ctx.send_chunk(node.clone()).await?;
            (open.object_number, offset)
        };
        *self.layout.entry(object_number).or_insert(0) += node.len() as u64;
        *sink.flushed = true;

        // Bound single-object size; the next node write opens a fresh
        // object under a fresh nonce.
        let full = sink
            .put
            .as_ref()
            .map_or(false, |open| open.ctx.bytes_put() >= sink.max_flush_size);
        if full {
            if let Some(open) = sink.put.take() {
                open.ctx.close().await?;
            }
        }

        Ok((object_number, offset))
    }

    async fn read_node(&mut self, location: NodeLocation) -> Result<Bytes> {
        self.client
            .object_get_range(
                self.account,
                self.container,
                &object_name(location.object_number),
                location.offset,
                location.length,
            )
            .await
    }

    fn discard_node(&mut self, object_number: u64, length: u64) {
        let bytes = self.layout.entry(object_number).or_insert(0);
        *bytes = bytes.saturating_sub(length);
    }
}

/// Hand out the next nonce, durably extending the reservation first when
/// the candidate would pass the reserved high-water mark.
async fn reserve_and_fetch(
    client: &dyn ObjectClient,
    account: &str,
    container: &str,
    header: &mut CheckpointHeader,
    next_nonce: &mut u64,
    step: u64,
) -> Result<u64> {
    *next_nonce += 1;
    if *next_nonce > header.reserved_to_nonce {
        let mut reserved = header.reserved_to_nonce;
        while reserved < *next_nonce {
            reserved += step;
        }
        header.reserved_to_nonce = reserved;
        post_checkpoint_header(client, account, container, header).await?;
        tracing::debug!(
            reserved_to_nonce = reserved,
            "durably extended nonce reservation"
        );
    }
    Ok(*next_nonce)
}

async fn post_checkpoint_header(
    client: &dyn ObjectClient,
    account: &str,
    container: &str,
    header: &CheckpointHeader,
) -> Result<()> {
    let mut headers = Headers::new();
    headers.insert(CHECKPOINT_HEADER_NAME.to_string(), header.to_string());
    client.container_post(account, container, headers).await
}
