use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use ramscope_core::analyses::{events, panic, sched, tasks};
use ramscope_core::report::{ReportSink, WriteSink};
use ramscope_core::{Session, SessionConfig};
use ramscope_utils::{info, init_logging, warn};

/// Post-mortem Linux kernel RAM-dump analyzer.
#[derive(Parser, Debug)]
#[command(name = "ramscope")]
#[command(version)]
#[command(about = "Post-mortem Linux kernel RAM-dump analyzer", long_about = None)]
struct Cli
{
    /// Directory containing the dump segments plus a manifest
    /// (dump_info.txt or load.cmm)
    #[arg(long, short = 'a')]
    autodump: Option<PathBuf>,

    /// Explicit segment file as PATH@HEXADDR (repeatable, overrides
    /// --autodump)
    #[arg(long = "ram-file", value_parser = parse_segment_spec)]
    ram_files: Vec<(PathBuf, u64)>,

    /// Kernel image with symbols and debug info
    #[arg(long, short = 'v')]
    vmlinux: PathBuf,

    /// Directory analysis reports are written to
    #[arg(long, short = 'o', default_value = ".")]
    outdir: PathBuf,

    /// The dumped kernel is 64-bit
    #[arg(long, default_value_t = false)]
    arm64: bool,

    /// Force the relocation (KASLR) offset instead of probing
    #[arg(long, value_parser = parse_hex)]
    kaslr_offset: Option<u64>,

    /// Physical address of the relocation magic record
    #[arg(long, value_parser = parse_hex)]
    kaslr_addr: Option<u64>,

    /// Force the base physical offset
    #[arg(long, value_parser = parse_hex)]
    phys_offset: Option<u64>,

    /// Force the linear-map base virtual address
    #[arg(long, value_parser = parse_hex)]
    page_offset: Option<u64>,

    /// Directory of module objects (<name>.ko) whose symbols are merged
    /// into the lookup table
    #[arg(long)]
    sym_path: Option<PathBuf>,

    /// Print all task information with backtraces (tasks.txt)
    #[arg(long, short = 't')]
    print_tasks: bool,

    /// Print per-cpu task scheduling statistics (tasks_sched_stats.txt)
    #[arg(long, short = 'T')]
    print_tasks_timestamps: bool,

    /// Check whether a kernel panic occurred (panic.txt)
    #[arg(long, short = 'p')]
    check_for_panic: bool,

    /// Extract persistent-RAM event and console logs
    #[arg(long)]
    pstore: bool,

    /// Verify the scheduler's tunables and runqueue domains
    #[arg(long)]
    sched_info: bool,

    /// Dump the final symbol lookup table (sym_table.txt)
    #[arg(long)]
    dump_symbol_table: bool,

    /// Run every analysis
    #[arg(long, short = 'e')]
    everything: bool,
}

fn parse_hex(text: &str) -> Result<u64, String>
{
    let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).map_err(|err| format!("invalid hex value {text:?}: {err}"))
}

fn parse_segment_spec(text: &str) -> Result<(PathBuf, u64), String>
{
    let (path, addr) = text
        .rsplit_once('@')
        .ok_or_else(|| format!("expected PATH@HEXADDR, got {text:?}"))?;
    Ok((PathBuf::from(path), parse_hex(addr)?))
}

fn main()
{
    // Initialize logging (reads from RUST_LOG env var)
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    std::fs::create_dir_all(&cli.outdir)?;

    let mut session = Session::open(SessionConfig {
        dump_dir: cli.autodump.clone(),
        segment_files: cli.ram_files.clone(),
        vmlinux: cli.vmlinux.clone(),
        arm64: cli.arm64,
        kaslr_offset: cli.kaslr_offset,
        kaslr_probe_addr: cli.kaslr_addr,
        phys_offset: cli.phys_offset,
        page_offset: cli.page_offset,
    })?;

    info!("linux banner: {}", session.banner().trim_end());
    if let Some(cmdline) = session.command_line() {
        info!("command line: {cmdline}");
    } else {
        warn!("could not read the saved command line");
    }

    if let Some(sym_dir) = &cli.sym_path {
        match session.merge_module_symbols(sym_dir) {
            Ok(count) => info!("merged symbols from {count} modules"),
            Err(err) => warn!("module symbol merge failed: {err}"),
        }
    }

    let open_sink = |name: &str| -> Result<WriteSink<BufWriter<File>>, std::io::Error> {
        Ok(WriteSink::new(BufWriter::new(File::create(cli.outdir.join(name))?)))
    };

    if cli.print_tasks || cli.everything {
        let mut out = open_sink("tasks.txt")?;
        let mut highlight = open_sink("tasks_highlight.txt")?;
        match tasks::dump_tasks(&session, &mut out, &mut highlight) {
            Ok(()) => info!("--- wrote tasks to tasks.txt"),
            Err(err) => warn!("task dump failed: {err}"),
        }
    }

    if cli.print_tasks_timestamps || cli.everything {
        let mut out = open_sink("tasks_sched_stats.txt")?;
        match tasks::dump_sched_stats(&session, &mut out) {
            Ok(()) => info!("--- wrote scheduling stats to tasks_sched_stats.txt"),
            Err(err) => warn!("scheduling stats failed: {err}"),
        }
    }

    if cli.check_for_panic || cli.everything {
        let mut out = open_sink("panic.txt")?;
        match panic::check_for_panic(&session, &mut out) {
            Ok(true) => info!("--- panic detected, details in panic.txt"),
            Ok(false) => info!("--- no panic detected"),
            Err(err) => warn!("panic check failed: {err}"),
        }
    }

    if cli.pstore || cli.everything {
        let mut events_out = open_sink("event_logs.txt")?;
        let mut console_out = open_sink("console_logs.txt")?;
        match events::extract_event_logs(&session, &mut events_out, &mut console_out) {
            Ok(()) => info!("--- wrote event and console logs"),
            Err(err) => warn!("event log extraction failed: {err}"),
        }
    }

    if cli.sched_info || cli.everything {
        let mut out = open_sink("sched_info.txt")?;
        match sched::check_scheduler(&session, &mut out) {
            Ok(()) => info!("--- wrote scheduler checks to sched_info.txt"),
            Err(err) => warn!("scheduler checks failed: {err}"),
        }
    }

    if cli.dump_symbol_table || cli.everything {
        let mut out = open_sink("sym_table.txt")?;
        for entry in session.symbols().iter() {
            out.line(&format!("0x{:x} {}", entry.addr, entry.name));
        }
        info!("--- wrote symbol table to sym_table.txt");
    }

    Ok(())
}
