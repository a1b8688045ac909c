//! REPL – interactive shell driving a simulated binary manager.
//!
//! Supported slash-commands:
//!   /help           – show this list
//!   /start          – provision simulated flash and boot the manager
//!   /count          – number of registered binaries
//!   /info [name]    – slot table, or one slot by binary name
//!   /load <idx>     – load one slot's active image
//!   /loadall        – load every slot in ascending order
//!   /reload <idx>   – terminate and load again
//!   /update <idx> <version> – stage a new image and flip partitions
//!   /fault <pid>    – inject a crash notification for a running pid
//!   /journal        – dump the simulated host's call journal
//!   /quit | /exit   – exit the CLI

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use emberrt_flash::{FlashStore, IMAGE_HEADER_SIZE, MetadataStore, RamFlash, SlotRecord, image};
use emberrt_loader::{ProcessHost, SimHost};
use emberrt_manager::{BinaryManager, BoardControl, IpcRouter, ManagerHandle, SimBoard};
use emberrt_types::{
    Completion, CompletionKind, PartitionId, ProcessId, Request, RequestOp, Response, SlotSnapshot,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::config::{self, Config};

const SHELL_CHANNEL: &str = "shell";
const RESPONSE_WAIT: Duration = Duration::from_secs(2);

/// A booted simulator: manager task, its collaborators, and the shell's
/// response channel.
struct Session {
    rt: tokio::runtime::Runtime,
    handle: ManagerHandle,
    host: Arc<SimHost>,
    board: Arc<SimBoard>,
    shell: mpsc::Receiver<Vec<u8>>,
    completions: broadcast::Receiver<Completion>,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut session: Option<Session> = None;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "emberrt>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let mut parts = line.trim().split_whitespace();
        let Some(cmd) = parts.next() else {
            continue;
        };
        let args: Vec<&str> = parts.collect();

        match cmd {
            "/help" => cmd_help(),
            "/start" => match cmd_start() {
                Ok(s) => session = Some(s),
                Err(e) => println!("{}: {}", "Boot failed".red(), e),
            },
            "/quit" | "/exit" => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            other => match session.as_mut() {
                Some(s) => dispatch(s, other, &args),
                None => println!(
                    "{} Run {} first.",
                    "Manager not booted.".yellow(),
                    "/start".bold()
                ),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "EmberRT Commands".bold().underline());
    println!("  {}            – provision flash and boot the manager", "/start".bold().cyan());
    println!("  {}            – number of registered binaries", "/count".bold().cyan());
    println!("  {}      – slot table, or one slot by name", "/info [name]".bold().cyan());
    println!("  {}      – load one slot's active image", "/load <idx>".bold().cyan());
    println!("  {}          – load every slot in order", "/loadall".bold().cyan());
    println!("  {}    – terminate and load again", "/reload <idx>".bold().cyan());
    println!("  {} – stage a new image and flip", "/update <idx> <ver>".bold().cyan());
    println!("  {}     – inject a crash for a running pid", "/fault <pid>".bold().cyan());
    println!("  {}          – simulated host call journal", "/journal".bold().cyan());
    println!("  {}      – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn dispatch(session: &mut Session, cmd: &str, args: &[&str]) {
    match cmd {
        "/count" => {
            if let Some(Response::Count(n)) = request(session, RequestOp::GetCount) {
                println!("  {} registered binaries", n.to_string().bold());
            }
        }
        "/info" => match args.first() {
            Some(name) => {
                if let Some(Response::Info(snap)) = request(
                    session,
                    RequestOp::GetInfoByName {
                        name: name.to_string(),
                    },
                ) {
                    print_slot_header();
                    print_slot(&snap);
                }
            }
            None => {
                if let Some(Response::InfoAll(snaps)) = request(session, RequestOp::GetInfoAll) {
                    print_slot_header();
                    for snap in &snaps {
                        print_slot(snap);
                    }
                }
            }
        },
        "/load" => {
            let Some(bin_idx) = parse_index(args) else {
                return;
            };
            if request(session, RequestOp::Load { bin_idx }).is_some() {
                drain_events(session, 1);
            }
        }
        "/loadall" => {
            if let Some(Response::LoadQueued { slots }) = request(session, RequestOp::LoadAll) {
                drain_events(session, slots.len());
            }
        }
        "/reload" => {
            let Some(bin_idx) = parse_index(args) else {
                return;
            };
            if request(session, RequestOp::Reload { bin_idx }).is_some() {
                drain_events(session, 1);
            }
        }
        "/update" => {
            let Some(bin_idx) = parse_index(args) else {
                return;
            };
            let Some(version) = args.get(1) else {
                println!("{} /update <idx> <version>", "Usage:".yellow());
                return;
            };
            // Fresh payload so the staged image visibly differs.
            let payload = vec![bin_idx as u8 ^ 0xA5; 4096];
            if let Some(Response::Info(snap)) = request(
                session,
                RequestOp::Update {
                    bin_idx,
                    payload,
                    ram_size: 4096,
                    bin_ver: version.to_string(),
                    kernel_ver: "1.0".to_string(),
                },
            ) {
                println!(
                    "  {} slot {} now serves {} from {}",
                    "✓".green().bold(),
                    snap.index,
                    snap.bin_ver.bold(),
                    snap.active_partition().to_string().yellow()
                );
                drain_events(session, 1);
            }
        }
        "/fault" => {
            let Some(pid) = args.first().and_then(|a| a.parse::<u32>().ok()) else {
                println!("{} /fault <pid>", "Usage:".yellow());
                return;
            };
            if let Err(e) = session
                .rt
                .block_on(session.handle.fault(ProcessId(pid)))
            {
                println!("{}: {}", "Fault injection failed".red(), e);
                return;
            }
            // RecoveryStarted + reload outcome, or a single escalation.
            drain_events(session, 2);
            if let Some(reason) = session.board.rebooted() {
                println!("  {} {}", "BOARD REBOOTED:".red().bold(), reason);
            }
        }
        "/journal" => {
            for call in session.host.journal() {
                println!("  {:?}", call);
            }
        }
        other => {
            println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "/help".bold()
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Boot sequence
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_start() -> Result<Session, String> {
    let cfg = load_config_or_default().sanitized();

    println!();
    println!("{}", "═══════════════════════════════════════".bold());
    println!("{}", "        EmberRT Boot Sequence          ".bold().cyan());
    println!("{}", "═══════════════════════════════════════".bold());

    // ── Step 1 – Flash ─────────────────────────────────────────────────────
    print!(
        "  [1/3] {} ({} slots × 2 partitions) … ",
        "Provisioning simulated flash".bold(),
        cfg.slot_count
    );
    io::stdout().flush().ok();
    let flash = provision_flash(&cfg).map_err(|e| e.to_string())?;
    println!("{}", "OK".green());

    // ── Step 2 – Manager ───────────────────────────────────────────────────
    print!("  [2/3] {} … ", "Booting binary manager".bold());
    io::stdout().flush().ok();
    let rt = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    let host = Arc::new(SimHost::new());
    let board = Arc::new(SimBoard::new());
    let router = Arc::new(IpcRouter::new());
    let shell = router.register(SHELL_CHANNEL, 16, cfg.max_msg_bytes);

    let (manager, handle) = BinaryManager::boot(
        Arc::clone(&flash) as Arc<dyn FlashStore>,
        PartitionId(0),
        Arc::clone(&host) as Arc<dyn ProcessHost>,
        Arc::clone(&board) as Arc<dyn BoardControl>,
        Arc::clone(&router),
    )
    .map_err(|e| e.to_string())?;
    let completions = manager.completions();
    rt.spawn(manager.run());
    println!("{}", "OK".green());

    // ── Step 3 – Boot load ─────────────────────────────────────────────────
    print!("  [3/3] {} … ", "Loading all registered binaries".bold());
    io::stdout().flush().ok();
    println!();

    let mut session = Session {
        rt,
        handle,
        host,
        board,
        shell,
        completions,
    };
    if let Some(Response::LoadQueued { slots }) = request(&mut session, RequestOp::LoadAll) {
        drain_events(&mut session, slots.len());
    }

    println!("{}", "═══════════════════════════════════════".bold());
    println!(
        "  {} EmberRT is {}. Type {} for commands.",
        "✓".green().bold(),
        "RUNNING".green().bold(),
        "/help".bold()
    );
    println!("{}", "═══════════════════════════════════════".bold());
    println!();
    Ok(session)
}

/// Build the simulated flash: metadata on partition 0, then two partitions
/// per slot with an image provisioned on each active one.
fn provision_flash(cfg: &Config) -> Result<Arc<RamFlash>, emberrt_flash::FlashError> {
    let mut sizes = vec![cfg.metadata_part_size];
    sizes.extend(std::iter::repeat_n(cfg.part_size, cfg.slot_count * 2));
    let flash = Arc::new(RamFlash::new(&sizes));

    let mut records = Vec::with_capacity(cfg.slot_count);
    for i in 0..cfg.slot_count {
        let active = PartitionId((i * 2 + 1) as u8);
        let payload = vec![(i as u8) ^ 0x5A; 4096];
        let header = image::write_image(flash.as_ref(), active, &payload, 4096, "1.0.0", "1.0")?;
        records.push(SlotRecord {
            name: format!("app{i}"),
            bin_size: header.bin_size,
            ram_size: header.ram_size,
            part_size: cfg.part_size,
            part_num: [(i * 2 + 1) as i8, (i * 2 + 2) as i8],
            inuse_idx: 0,
            bin_offset: IMAGE_HEADER_SIZE,
            bin_ver: header.bin_ver.clone(),
            kernel_ver: header.kernel_ver.clone(),
        });
    }

    let metadata = MetadataStore::new(Arc::clone(&flash) as Arc<dyn FlashStore>, PartitionId(0));
    metadata.write_table(&records)?;
    Ok(flash)
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn load_config_or_default() -> Config {
    match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            println!("{}: {} – using defaults", "Config error".red(), e);
            Config::default()
        }
    }
}

/// Send one request and wait for its response on the shell channel.
/// Errors are printed; the caller only sees successful responses.
fn request(session: &mut Session, op: RequestOp) -> Option<Response> {
    let sent = session.rt.block_on(session.handle.request(Request {
        reply_to: SHELL_CHANNEL.to_string(),
        op,
    }));
    if let Err(e) = sent {
        println!("{}: {}", "Request failed".red(), e);
        return None;
    }

    let payload = session
        .rt
        .block_on(timeout(RESPONSE_WAIT, session.shell.recv()));
    match payload {
        Ok(Some(bytes)) => match serde_json::from_slice::<Response>(&bytes) {
            Ok(Response::Error(e)) => {
                println!("{}: {}", "Error".red(), e);
                None
            }
            Ok(response) => Some(response),
            Err(e) => {
                println!("{}: {}", "Malformed response".red(), e);
                None
            }
        },
        Ok(None) => {
            println!("{}", "Response channel closed.".red());
            None
        }
        Err(_) => {
            println!("{}", "Timed out waiting for a response.".red());
            None
        }
    }
}

/// Print up to `expect` completion events, giving up quietly on timeout
/// (an escalation produces fewer events than a recovery, for instance).
fn drain_events(session: &mut Session, expect: usize) {
    for _ in 0..expect {
        let event = session
            .rt
            .block_on(timeout(RESPONSE_WAIT, session.completions.recv()));
        match event {
            Ok(Ok(completion)) => print_completion(&completion.kind),
            _ => break,
        }
    }
}

fn print_completion(kind: &CompletionKind) {
    match kind {
        CompletionKind::Loaded { slot, bin_id } => {
            println!("  {} slot {} loaded as {}", "✓".green().bold(), slot, bin_id.to_string().bold());
        }
        CompletionKind::LoadFailed { slot, error } => {
            println!("  {} slot {} failed: {}", "✗".red().bold(), slot, error);
        }
        CompletionKind::RecoveryStarted { slot, faulted } => {
            println!(
                "  {} {} faulted; slot {} isolated, reload queued",
                "⚠".yellow().bold(),
                faulted,
                slot
            );
        }
        CompletionKind::RecoveryEscalated { faulted } => {
            println!(
                "  {} {} unattributable – escalating to reboot",
                "⚠".red().bold(),
                faulted
            );
        }
        CompletionKind::Updated { slot, inuse_idx } => {
            println!(
                "  {} slot {} flipped to partition index {}",
                "✓".green().bold(),
                slot,
                inuse_idx
            );
        }
    }
}

fn print_slot_header() {
    println!(
        "  {:<4} {:<12} {:<10} {:<10} {:<8} {:<8}",
        "idx".bold(),
        "name".bold(),
        "state".bold(),
        "version".bold(),
        "active".bold(),
        "size".bold()
    );
}

fn print_slot(snap: &SlotSnapshot) {
    let state = match snap.bin_id {
        Some(pid) => pid.to_string().green().to_string(),
        None => "unloaded".dimmed().to_string(),
    };
    println!(
        "  {:<4} {:<12} {:<10} {:<10} {:<8} {:<8}",
        snap.index,
        snap.name,
        state,
        snap.bin_ver,
        snap.active_partition().to_string(),
        snap.bin_size
    );
}

fn parse_index(args: &[&str]) -> Option<usize> {
    match args.first().and_then(|a| a.parse::<usize>().ok()) {
        Some(idx) => Some(idx),
        None => {
            println!("{} expected a slot index", "Usage:".yellow());
            None
        }
    }
}
