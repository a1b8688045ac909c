//! The loading thread and its command queue.

use std::sync::Arc;
use std::thread;

use emberrt_flash::{FlashError, FlashStore, IMAGE_HEADER_SIZE, ImageHeader, checksum};
use emberrt_types::{BinError, LOADER_THREAD_NAME, PartitionId, ProcessId, SlotSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::process::{ProcessHost, ProcessImage};

/// Depth of the bounded command queue.
pub const QUEUE_DEPTH: usize = 16;

/// One command for the loading thread.
///
/// Each command carries the committed slot snapshot(s) taken by the manager
/// at enqueue time; the loader never reads the registry itself.
#[derive(Debug, Clone)]
pub enum LoadCommand {
    /// Load the single slot's active image.
    Load(SlotSnapshot),
    /// Load every slot, in ascending slot-index order.
    LoadAll(Vec<SlotSnapshot>),
    /// Terminate the slot's prior process group (if any), then load again.
    Reload(SlotSnapshot),
}

/// Per-slot outcome reported back to the manager main loop, which is the
/// only component allowed to mutate the registry.
#[derive(Debug, Clone)]
pub struct LoaderOutcome {
    pub slot: usize,
    /// `true` when the command was a `Reload` (recovery / update path).
    pub reloaded: bool,
    /// The partition the image was read from.
    pub partition: PartitionId,
    pub result: Result<ProcessId, BinError>,
}

/// Handle to the loading thread.
///
/// Dropping the handle closes the command queue; the thread drains what is
/// already queued and exits.
pub struct Loader {
    tx: mpsc::Sender<LoadCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Loader {
    /// Spawn the loading thread.
    ///
    /// Commands are consumed strictly FIFO from a queue of [`QUEUE_DEPTH`];
    /// outcomes are delivered on `outcome_tx`.
    pub fn spawn(
        flash: Arc<dyn FlashStore>,
        host: Arc<dyn ProcessHost>,
        outcome_tx: mpsc::Sender<LoaderOutcome>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = thread::Builder::new()
            .name(LOADER_THREAD_NAME.to_string())
            .spawn(move || run(flash, host, rx, outcome_tx))
            .expect("failed to spawn loading thread");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Sender half of the command queue.
    pub fn sender(&self) -> mpsc::Sender<LoadCommand> {
        self.tx.clone()
    }

    /// Close the queue and wait for the thread to drain and exit.
    pub fn join(mut self) {
        drop(self.tx);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("loading thread panicked");
        }
    }
}

fn run(
    flash: Arc<dyn FlashStore>,
    host: Arc<dyn ProcessHost>,
    mut rx: mpsc::Receiver<LoadCommand>,
    outcome_tx: mpsc::Sender<LoaderOutcome>,
) {
    info!("loading thread up");
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            LoadCommand::Load(job) => {
                let outcome = LoaderOutcome {
                    slot: job.index,
                    reloaded: false,
                    partition: job.active_partition(),
                    result: load_one(flash.as_ref(), host.as_ref(), &job, false),
                };
                if outcome_tx.blocking_send(outcome).is_err() {
                    break;
                }
            }
            LoadCommand::LoadAll(jobs) => {
                // Ascending slot order: the manager snapshots in order and
                // this thread preserves it.
                for job in jobs {
                    let outcome = LoaderOutcome {
                        slot: job.index,
                        reloaded: false,
                        partition: job.active_partition(),
                        result: load_one(flash.as_ref(), host.as_ref(), &job, false),
                    };
                    if outcome_tx.blocking_send(outcome).is_err() {
                        return;
                    }
                }
            }
            LoadCommand::Reload(job) => {
                let outcome = LoaderOutcome {
                    slot: job.index,
                    reloaded: true,
                    partition: job.active_partition(),
                    result: load_one(flash.as_ref(), host.as_ref(), &job, true),
                };
                if outcome_tx.blocking_send(outcome).is_err() {
                    break;
                }
            }
        }
    }
    info!("loading thread down");
}

/// Load one slot: header check, streamed checksum, process creation.
///
/// A `Reload` first terminates the prior process group; once issued it runs
/// to completion, success or not.
fn load_one(
    flash: &dyn FlashStore,
    host: &dyn ProcessHost,
    job: &SlotSnapshot,
    reload: bool,
) -> Result<ProcessId, BinError> {
    let slot = job.index;
    let partition = job.active_partition();

    if reload && let Some(prior) = job.bin_id {
        debug!(slot, %prior, "terminating prior process group");
        host.terminate_process_group(prior)
            .map_err(|details| BinError::Terminate { slot, details })?;
    }

    let header = ImageHeader::read_from(flash, partition).map_err(|e| integrity_or_io(slot, e))?;

    if IMAGE_HEADER_SIZE as u64 + header.bin_size as u64 > job.part_size as u64 {
        return Err(BinError::Integrity {
            slot,
            details: format!(
                "declared size {} B + header exceeds partition size {}",
                header.bin_size, job.part_size
            ),
        });
    }

    let computed = checksum::crc32_over(flash, partition, IMAGE_HEADER_SIZE, header.bin_size)
        .map_err(|e| BinError::Io(e.to_string()))?;
    if computed != header.checksum {
        warn!(
            slot,
            stored = format_args!("{:#010x}", header.checksum),
            computed = format_args!("{computed:#010x}"),
            "checksum mismatch; slot left unloaded"
        );
        return Err(BinError::Integrity {
            slot,
            details: format!(
                "stored {:#010x}, computed {computed:#010x}",
                header.checksum
            ),
        });
    }

    let image = ProcessImage {
        name: job.name.clone(),
        partition,
        offset: IMAGE_HEADER_SIZE,
        size: header.bin_size,
        ram_size: header.ram_size,
    };
    let pid = host
        .create_process(&image)
        .map_err(|details| BinError::Spawn { slot, details })?;
    info!(slot, %pid, name = %job.name, %partition, "binary loaded");
    Ok(pid)
}

/// Header corruption is an integrity failure; everything else from the
/// flash layer is I/O.
fn integrity_or_io(slot: usize, e: FlashError) -> BinError {
    match e {
        FlashError::Corrupt(details) => BinError::Integrity { slot, details },
        other => BinError::Io(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SimHost;
    use emberrt_flash::{RamFlash, image::write_image};
    use emberrt_types::PartitionId;
    use std::sync::Mutex;

    const PART_SIZE: u32 = 2048;

    /// Flash with three provisioned slots, each image on partition 2*i.
    fn provisioned_flash() -> Arc<RamFlash> {
        let flash = Arc::new(RamFlash::new(&[PART_SIZE; 6]));
        for i in 0..3u8 {
            let payload = vec![i + 1; 300];
            write_image(
                flash.as_ref(),
                PartitionId(i * 2),
                &payload,
                1024,
                "1.0.0",
                "1.0",
            )
            .unwrap();
        }
        flash
    }

    fn job(index: usize, bin_id: Option<ProcessId>) -> SlotSnapshot {
        SlotSnapshot {
            index,
            bin_id,
            name: format!("bin{index}"),
            bin_size: 300,
            ram_size: 1024,
            part_size: PART_SIZE,
            part_num: [
                PartitionId(index as u8 * 2),
                PartitionId(index as u8 * 2 + 1),
            ],
            inuse_idx: 0,
            bin_offset: IMAGE_HEADER_SIZE,
            bin_ver: "1.0.0".to_string(),
            kernel_ver: "1.0".to_string(),
        }
    }

    fn spawn_loader(
        flash: Arc<RamFlash>,
        host: Arc<SimHost>,
    ) -> (Loader, mpsc::Receiver<LoaderOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::channel(QUEUE_DEPTH);
        let loader = Loader::spawn(flash, host, outcome_tx);
        (loader, outcome_rx)
    }

    #[test]
    fn load_all_produces_outcomes_in_ascending_slot_order() {
        let host = Arc::new(SimHost::new());
        let (loader, mut outcomes) = spawn_loader(provisioned_flash(), Arc::clone(&host));

        let jobs = vec![job(0, None), job(1, None), job(2, None)];
        loader
            .sender()
            .blocking_send(LoadCommand::LoadAll(jobs))
            .unwrap();

        let mut pids = Vec::new();
        for expected_slot in 0..3 {
            let outcome = outcomes.blocking_recv().unwrap();
            assert_eq!(outcome.slot, expected_slot);
            pids.push(outcome.result.unwrap());
        }
        // Each slot got a distinct pid.
        pids.sort();
        pids.dedup();
        assert_eq!(pids.len(), 3);
        loader.join();
    }

    #[test]
    fn commands_are_processed_fifo() {
        let host = Arc::new(SimHost::new());
        let (loader, mut outcomes) = spawn_loader(provisioned_flash(), Arc::clone(&host));

        let tx = loader.sender();
        tx.blocking_send(LoadCommand::Load(job(2, None))).unwrap();
        tx.blocking_send(LoadCommand::Load(job(0, None))).unwrap();
        tx.blocking_send(LoadCommand::Load(job(1, None))).unwrap();

        let order: Vec<usize> = (0..3)
            .map(|_| outcomes.blocking_recv().unwrap().slot)
            .collect();
        assert_eq!(order, vec![2, 0, 1]);
        drop(tx);
        loader.join();
    }

    #[test]
    fn checksum_mismatch_never_creates_a_process() {
        let flash = provisioned_flash();
        // Corrupt one payload byte of slot 1's image.
        flash
            .write(PartitionId(2), IMAGE_HEADER_SIZE + 120, &[0xEE])
            .unwrap();

        let host = Arc::new(SimHost::new());
        let (loader, mut outcomes) = spawn_loader(flash, Arc::clone(&host));
        loader
            .sender()
            .blocking_send(LoadCommand::Load(job(1, None)))
            .unwrap();

        let outcome = outcomes.blocking_recv().unwrap();
        assert!(matches!(
            outcome.result,
            Err(BinError::Integrity { slot: 1, .. })
        ));
        // No process was created.
        assert!(host.journal().is_empty());
        loader.join();
    }

    #[test]
    fn bad_header_magic_is_an_integrity_error() {
        let flash = provisioned_flash();
        flash.write(PartitionId(0), 0, b"XXXX").unwrap();

        let host = Arc::new(SimHost::new());
        let (loader, mut outcomes) = spawn_loader(flash, Arc::clone(&host));
        loader
            .sender()
            .blocking_send(LoadCommand::Load(job(0, None)))
            .unwrap();

        let outcome = outcomes.blocking_recv().unwrap();
        assert!(matches!(
            outcome.result,
            Err(BinError::Integrity { slot: 0, .. })
        ));
        loader.join();
    }

    #[test]
    fn reload_terminates_prior_group_before_spawning() {
        let host = Arc::new(SimHost::new());
        let (loader, mut outcomes) = spawn_loader(provisioned_flash(), Arc::clone(&host));

        let prior = ProcessId(55);
        loader
            .sender()
            .blocking_send(LoadCommand::Reload(job(0, Some(prior))))
            .unwrap();

        let outcome = outcomes.blocking_recv().unwrap();
        assert!(outcome.reloaded);
        assert_eq!(outcome.partition, PartitionId(0));
        let new_pid = outcome.result.unwrap();
        assert_ne!(new_pid, prior);

        let journal = host.journal();
        assert!(matches!(
            journal[0],
            crate::process::HostCall::TerminatedGroup(p) if p == prior
        ));
        assert!(matches!(
            journal[1],
            crate::process::HostCall::Created { .. }
        ));
        loader.join();
    }

    /// Host whose spawns always fail.
    struct RefusingHost;
    impl ProcessHost for RefusingHost {
        fn create_process(&self, _image: &ProcessImage) -> Result<ProcessId, String> {
            Err("out of task slots".to_string())
        }
        fn terminate_process_group(&self, _bin_id: ProcessId) -> Result<(), String> {
            Ok(())
        }
        fn exclude_from_scheduling(&self, _bin_id: ProcessId) {}
    }

    #[test]
    fn spawn_failure_is_reported_as_spawn_error() {
        let (outcome_tx, mut outcomes) = mpsc::channel(QUEUE_DEPTH);
        let loader = Loader::spawn(provisioned_flash(), Arc::new(RefusingHost), outcome_tx);
        loader
            .sender()
            .blocking_send(LoadCommand::Load(job(0, None)))
            .unwrap();

        let outcome = outcomes.blocking_recv().unwrap();
        assert!(matches!(outcome.result, Err(BinError::Spawn { slot: 0, .. })));
        loader.join();
    }

    /// Host whose process groups refuse to die.
    struct ImmortalHost {
        spawned: Mutex<bool>,
    }
    impl ProcessHost for ImmortalHost {
        fn create_process(&self, _image: &ProcessImage) -> Result<ProcessId, String> {
            *self.spawned.lock().unwrap() = true;
            Ok(ProcessId(1))
        }
        fn terminate_process_group(&self, _bin_id: ProcessId) -> Result<(), String> {
            Err("group still has live members".to_string())
        }
        fn exclude_from_scheduling(&self, _bin_id: ProcessId) {}
    }

    #[test]
    fn failed_termination_aborts_the_reload_as_a_termination_error() {
        let host = Arc::new(ImmortalHost {
            spawned: Mutex::new(false),
        });
        let (outcome_tx, mut outcomes) = mpsc::channel(QUEUE_DEPTH);
        let loader = Loader::spawn(
            provisioned_flash(),
            Arc::clone(&host) as Arc<dyn ProcessHost>,
            outcome_tx,
        );
        loader
            .sender()
            .blocking_send(LoadCommand::Reload(job(0, Some(ProcessId(55)))))
            .unwrap();

        let outcome = outcomes.blocking_recv().unwrap();
        assert!(matches!(
            outcome.result,
            Err(BinError::Terminate { slot: 0, .. })
        ));
        // The reload stopped before creating a replacement.
        assert!(!*host.spawned.lock().unwrap());
        loader.join();
    }

    /// Host that records spawn attempts; used to prove a queued command
    /// still runs after an earlier failure.
    struct CountingHost {
        calls: Mutex<u32>,
    }
    impl ProcessHost for CountingHost {
        fn create_process(&self, _image: &ProcessImage) -> Result<ProcessId, String> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            Ok(ProcessId(*calls))
        }
        fn terminate_process_group(&self, _bin_id: ProcessId) -> Result<(), String> {
            Ok(())
        }
        fn exclude_from_scheduling(&self, _bin_id: ProcessId) {}
    }

    #[test]
    fn failure_on_one_slot_does_not_stall_the_queue() {
        let flash = provisioned_flash();
        // Break slot 0's checksum; slot 1 stays intact.
        flash
            .write(PartitionId(0), IMAGE_HEADER_SIZE, &[0x00])
            .unwrap();

        let host = Arc::new(CountingHost {
            calls: Mutex::new(0),
        });
        let (outcome_tx, mut outcomes) = mpsc::channel(QUEUE_DEPTH);
        let loader = Loader::spawn(flash, Arc::clone(&host) as Arc<dyn ProcessHost>, outcome_tx);

        let tx = loader.sender();
        tx.blocking_send(LoadCommand::Load(job(0, None))).unwrap();
        tx.blocking_send(LoadCommand::Load(job(1, None))).unwrap();

        let first = outcomes.blocking_recv().unwrap();
        assert!(first.result.is_err());
        let second = outcomes.blocking_recv().unwrap();
        assert!(second.result.is_ok());
        drop(tx);
        loader.join();
    }
}
