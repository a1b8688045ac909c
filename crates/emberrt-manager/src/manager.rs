//! [`BinaryManager`] – the main loop and single registry writer.
//!
//! Everything funnels into one `tokio::select!` loop: gateway requests and
//! fault notifications arrive as [`ManagerEvent`]s on one queue, per-slot
//! load outcomes come back from the loading thread on another.  The loop
//! never reads flash or spawns processes itself; it snapshots committed
//! slot state, hands commands to the loader, and applies outcomes as the
//! only component allowed to mutate the [`Registry`].

use std::sync::Arc;

use emberrt_flash::{FlashStore, IMAGE_HEADER_SIZE, MetadataStore, image};
use emberrt_loader::{LoadCommand, Loader, LoaderOutcome, ProcessHost, QUEUE_DEPTH};
use emberrt_registry::Registry;
use emberrt_types::{
    BinError, Completion, CompletionKind, PartitionId, ProcessId, Request, RequestOp, Response,
    SlotSnapshot,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::board::BoardControl;
use crate::gateway::IpcRouter;
use crate::recovery::{RecoveryAction, RecoveryController};

/// Depth of the manager's inbound event queue.
const EVENT_QUEUE_DEPTH: usize = 32;
/// Capacity of the completion broadcast channel.
const COMPLETION_CAPACITY: usize = 64;

/// One event on the manager's inbound queue.
#[derive(Debug)]
pub enum ManagerEvent {
    /// A gateway request from an external caller.
    Request(Request),
    /// Kernel fault hook: the process `pid` crashed.
    Fault { pid: ProcessId },
}

/// Cloneable feeder for the manager's event queue.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerEvent>,
}

impl ManagerHandle {
    /// Submit a gateway request; its response arrives on the channel the
    /// request names in `reply_to`.
    pub async fn request(&self, request: Request) -> Result<(), BinError> {
        self.tx
            .send(ManagerEvent::Request(request))
            .await
            .map_err(|_| BinError::Channel("manager event queue closed".to_string()))
    }

    /// Report a crashed process to the recovery path.
    pub async fn fault(&self, pid: ProcessId) -> Result<(), BinError> {
        self.tx
            .send(ManagerEvent::Fault { pid })
            .await
            .map_err(|_| BinError::Channel("manager event queue closed".to_string()))
    }
}

/// The binary manager main loop.  Construct with [`BinaryManager::boot`],
/// then drive with [`BinaryManager::run`] on a task of its own.
pub struct BinaryManager {
    registry: Registry,
    flash: Arc<dyn FlashStore>,
    host: Arc<dyn ProcessHost>,
    board: Arc<dyn BoardControl>,
    router: Arc<IpcRouter>,
    recovery: RecoveryController,
    loader: Loader,
    loader_tx: mpsc::Sender<LoadCommand>,
    event_rx: mpsc::Receiver<ManagerEvent>,
    outcome_rx: mpsc::Receiver<LoaderOutcome>,
    completion_tx: broadcast::Sender<Completion>,
}

impl BinaryManager {
    /// Populate the registry from the metadata partition and spawn the
    /// loading thread.  No binary is loaded yet; boot loading is an
    /// explicit [`RequestOp::LoadAll`].
    pub fn boot(
        flash: Arc<dyn FlashStore>,
        metadata_partition: PartitionId,
        host: Arc<dyn ProcessHost>,
        board: Arc<dyn BoardControl>,
        router: Arc<IpcRouter>,
    ) -> Result<(Self, ManagerHandle), BinError> {
        let metadata = MetadataStore::new(Arc::clone(&flash), metadata_partition);
        let registry = Registry::from_flash(metadata)?;

        let (outcome_tx, outcome_rx) = mpsc::channel(QUEUE_DEPTH);
        let loader = Loader::spawn(Arc::clone(&flash), Arc::clone(&host), outcome_tx);
        let loader_tx = loader.sender();

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (completion_tx, _) = broadcast::channel(COMPLETION_CAPACITY);

        info!(
            binaries = registry.get_count(),
            "binary manager up"
        );
        Ok((
            Self {
                registry,
                flash,
                host,
                board,
                router,
                recovery: RecoveryController::new(),
                loader,
                loader_tx,
                event_rx,
                outcome_rx,
                completion_tx,
            },
            ManagerHandle { tx: event_tx },
        ))
    }

    /// Subscribe to completion events (loads, failures, recovery, updates).
    pub fn completions(&self) -> broadcast::Receiver<Completion> {
        self.completion_tx.subscribe()
    }

    /// Run until every [`ManagerHandle`] is dropped, then drain the loading
    /// thread and exit.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(ManagerEvent::Request(request)) => self.handle_request(request),
                    Some(ManagerEvent::Fault { pid }) => self.handle_fault(pid),
                    None => break,
                },
                outcome = self.outcome_rx.recv() => match outcome {
                    Some(outcome) => self.handle_outcome(outcome),
                    None => break,
                },
            }
        }
        info!("binary manager shutting down");
        drop(self.loader_tx);
        self.loader.join();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Gateway requests
    // ─────────────────────────────────────────────────────────────────────

    fn handle_request(&mut self, request: Request) {
        let reply_to = request.reply_to;
        let response = match request.op {
            RequestOp::GetCount => Response::Count(self.registry.get_count()),
            RequestOp::GetIndexById { bin_id } => match self.registry.find_by_id(bin_id) {
                Ok(index) => Response::Index(index),
                Err(e) => Response::Error(e),
            },
            RequestOp::GetInfoByName { name } => {
                match self
                    .registry
                    .find_by_name(&name)
                    .and_then(|index| self.registry.snapshot(index))
                {
                    Ok(snapshot) => Response::Info(snapshot),
                    Err(e) => Response::Error(e),
                }
            }
            RequestOp::GetInfoAll => Response::InfoAll(self.registry.snapshot_all()),
            RequestOp::Load { bin_idx } => self.queue_load(bin_idx, false),
            RequestOp::Reload { bin_idx } => self.queue_load(bin_idx, true),
            RequestOp::LoadAll => self.queue_load_all(),
            RequestOp::Update {
                bin_idx,
                payload,
                ram_size,
                bin_ver,
                kernel_ver,
            } => match self.stage_update(bin_idx, &payload, ram_size, &bin_ver, &kernel_ver) {
                Ok(snapshot) => Response::Info(snapshot),
                Err(e) => Response::Error(e),
            },
        };
        self.respond(&reply_to, &response);
    }

    /// Snapshot one slot and queue it to the loading thread.
    fn queue_load(&mut self, bin_idx: usize, reload: bool) -> Response {
        let snapshot = match self.registry.snapshot(bin_idx) {
            Ok(snapshot) => snapshot,
            Err(e) => return Response::Error(e),
        };
        let command = if reload {
            LoadCommand::Reload(snapshot)
        } else {
            LoadCommand::Load(snapshot)
        };
        match self.enqueue(command) {
            Ok(()) => Response::LoadQueued {
                slots: vec![bin_idx],
            },
            Err(e) => Response::Error(e),
        }
    }

    /// Snapshot every slot in ascending index order and queue one batch.
    fn queue_load_all(&mut self) -> Response {
        let snapshots = self.registry.snapshot_all();
        let slots: Vec<usize> = snapshots.iter().map(|s| s.index).collect();
        match self.enqueue(LoadCommand::LoadAll(snapshots)) {
            Ok(()) => Response::LoadQueued { slots },
            Err(e) => Response::Error(e),
        }
    }

    fn enqueue(&self, command: LoadCommand) -> Result<(), BinError> {
        self.loader_tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                BinError::Channel("loader command queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                BinError::Channel("loader command queue closed".to_string())
            }
        })
    }

    /// Stage a new image on the slot's inactive partition, then flip.
    ///
    /// The running image keeps executing from the old partition; the flip
    /// only changes what the next load reads.  A failure at any point
    /// leaves the slot serving the previous image.
    fn stage_update(
        &mut self,
        bin_idx: usize,
        payload: &[u8],
        ram_size: u32,
        bin_ver: &str,
        kernel_ver: &str,
    ) -> Result<SlotSnapshot, BinError> {
        let snapshot = self.registry.snapshot(bin_idx)?;
        if IMAGE_HEADER_SIZE as u64 + payload.len() as u64 > snapshot.part_size as u64 {
            return Err(BinError::CommitFailed {
                slot: bin_idx,
                details: format!(
                    "image ({} B + header) exceeds partition size {}",
                    payload.len(),
                    snapshot.part_size
                ),
            });
        }

        let staging = snapshot.staging_partition();
        // An update commits by flipping `inuse_idx`, but the old process
        // keeps executing from its original partition until the next
        // reload.  A second update before that reload would stage onto the
        // partition backing the live image.
        if self.registry.running_from(bin_idx)? == Some(staging) {
            return Err(BinError::CommitFailed {
                slot: bin_idx,
                details: format!(
                    "{staging} still backs the running process; reload before updating again"
                ),
            });
        }
        let header = image::write_image(
            self.flash.as_ref(),
            staging,
            payload,
            ram_size,
            bin_ver,
            kernel_ver,
        )
        .map_err(|e| BinError::CommitFailed {
            slot: bin_idx,
            details: e.to_string(),
        })?;

        let inuse_idx = self.registry.commit_update(bin_idx, &header)?;
        info!(slot = bin_idx, %staging, bin_ver, "update staged and committed");
        self.publish(
            "emberrt-manager::update",
            CompletionKind::Updated {
                slot: bin_idx,
                inuse_idx,
            },
        );
        self.registry.snapshot(bin_idx)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Faults and loader outcomes
    // ─────────────────────────────────────────────────────────────────────

    fn handle_fault(&mut self, pid: ProcessId) {
        match self
            .recovery
            .on_fault(pid, &self.registry, self.host.as_ref())
        {
            Some(RecoveryAction::Reload { slot, faulted }) => {
                // Snapshot still carries the faulted pid, so the loading
                // thread terminates the group before respawning.
                let queued = self
                    .registry
                    .snapshot(slot)
                    .and_then(|snapshot| self.enqueue(LoadCommand::Reload(snapshot)));
                match queued {
                    Ok(()) => self.publish(
                        "emberrt-manager::recovery",
                        CompletionKind::RecoveryStarted { slot, faulted },
                    ),
                    Err(error) => {
                        // No outcome will ever arrive for this reload;
                        // release the controller here so recovery cannot
                        // wedge, then admit the next queued fault.
                        error!(slot, %faulted, error = %error, "recovery reload could not be queued");
                        self.publish(
                            "emberrt-manager::recovery",
                            CompletionKind::LoadFailed { slot, error },
                        );
                        if let Some(next) = self.recovery.on_reload_outcome(slot) {
                            self.handle_fault(next);
                        }
                    }
                }
            }
            Some(RecoveryAction::Escalate { faulted }) => {
                self.publish(
                    "emberrt-manager::recovery",
                    CompletionKind::RecoveryEscalated { faulted },
                );
                self.board
                    .reboot(&BinError::UnrecoverableFault(faulted).to_string());
            }
            None => {} // queued behind the in-flight recovery
        }
    }

    fn handle_outcome(&mut self, outcome: LoaderOutcome) {
        let slot = outcome.slot;
        match outcome.result {
            Ok(bin_id) => {
                if let Err(e) = self.registry.mark_loaded(slot, bin_id, outcome.partition) {
                    error!(slot, error = %e, "loaded slot vanished from registry");
                }
                self.publish(
                    "emberrt-manager::loader",
                    CompletionKind::Loaded { slot, bin_id },
                );
            }
            Err(error) => {
                warn!(slot, %error, "load failed; slot left unloaded");
                if let Err(e) = self.registry.mark_unloaded(slot) {
                    error!(slot, error = %e, "failed slot vanished from registry");
                }
                self.publish(
                    "emberrt-manager::loader",
                    CompletionKind::LoadFailed { slot, error },
                );
            }
        }

        // A finished reload releases the recovery controller; admit the
        // next queued fault, if any.
        if outcome.reloaded
            && let Some(next) = self.recovery.on_reload_outcome(slot)
        {
            self.handle_fault(next);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Plumbing
    // ─────────────────────────────────────────────────────────────────────

    fn respond(&self, reply_to: &str, response: &Response) {
        if let Err(e) = self.router.send(reply_to, response) {
            warn!(channel = reply_to, error = %e, "response could not be delivered");
        }
    }

    fn publish(&self, source: &str, kind: CompletionKind) {
        // Lagging or absent subscribers are not an error.
        let _ = self.completion_tx.send(Completion::now(source, kind));
    }
}
