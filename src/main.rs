//! Entry point for the `libernet` tool.
//!
//! Usage:
//!   libernet serve --storage DIR --port N          → run a block server
//!   libernet add|remove|list|backup|restore ...    → drive backups
//!
//! Backup actions talk to a block server over HTTP; `serve` runs one over
//! a local storage directory.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing_subscriber::EnvFilter;

use libernet::backup::{self, BackupContext, DEFAULT_DAYS, DEFAULT_MONTHS};
use libernet::bundle::BundleOptions;
use libernet::cli::{self, Commands};
use libernet::error::{LibernetError, Result};
use libernet::message::{Center, Channel, Progress};
use libernet::server;
use libernet::settings;
use libernet::store::{BlockStore, DiskStore, ProxyStore};

fn main() -> std::process::ExitCode {
    let args = cli::run();

    if let Err(error) = run_app(args.command) {
        eprintln!("Error: {error}");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}

/// Roll the log if it grew past the limit and send tracing output to it.
fn init_logging(storage: &Path) -> Result<()> {
    fs::create_dir_all(storage).map_err(|e| LibernetError::io(e, storage))?;
    let log_path = settings::roll_log(storage)?;
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| LibernetError::io(e, &log_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .init();
    Ok(())
}

fn run_app(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { storage, port } => run_server(&storage, port),
        Commands::Add { args } => run_backup_action("add", args),
        Commands::Remove { args } => run_backup_action("remove", args),
        Commands::List { args } => run_backup_action("list", args),
        Commands::Backup { args } => run_backup_action("backup", args),
        Commands::Restore { args } => run_backup_action("restore", args),
    }
}

fn run_server(storage: &Path, port: Option<u16>) -> Result<()> {
    init_logging(storage)?;

    let mut server_settings = settings::load_server_settings(storage)?;
    let (port, changed) = settings::reconcile(port, server_settings.port, settings::DEFAULT_PORT);

    if changed || server_settings.port.is_none() {
        server_settings.port = Some(port);
        settings::save_server_settings(storage, &server_settings)?;
    }

    let store = Arc::new(DiskStore::open(storage));
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| LibernetError::io(e, "tokio runtime"))?;
    runtime.block_on(server::serve(store, port))
}

/// Reconcile arguments against `backup.json`, remembering what the user
/// chose for next time.
fn resolve_backup_settings(
    args: &cli::BackupArgs,
) -> Result<(String, u16, BackupContext)> {
    let mut stored = settings::load_backup_settings(&args.storage)?;
    let mut save_needed = false;

    let server = args
        .server
        .clone()
        .or_else(|| stored.last_server())
        .unwrap_or_else(|| settings::DEFAULT_SERVER.to_string());

    if stored.last_server().as_deref() != Some(server.as_str()) {
        stored.set_last_server(&server);
        save_needed = true;
    }

    let stored_port = stored.server.get(&server).and_then(|entry| entry.port);
    let (port, port_changed) = settings::reconcile(args.port, stored_port, settings::DEFAULT_PORT);

    if port_changed || stored_port.is_none() {
        stored.server.entry(server.clone()).or_default().port = Some(port);
        save_needed = true;
    }

    let (days, days_changed) = settings::reconcile(args.days, stored.days, DEFAULT_DAYS);

    if days_changed || stored.days.is_none() {
        stored.days = Some(days);
        save_needed = true;
    }

    let (months, months_changed) = settings::reconcile(args.months, stored.months, DEFAULT_MONTHS);

    if months_changed || stored.months.is_none() {
        stored.months = Some(months);
        save_needed = true;
    }

    let machine = match args.machine.clone().or_else(|| stored.machine.clone()) {
        Some(machine) => machine,
        None => cli::prompt_line("This machine's name (--machine): ")?,
    };

    if machine.is_empty() {
        return Err(LibernetError::Invariant(format!(
            "Must specify --machine for {}",
            args.storage.display()
        )));
    }

    if stored.machine.as_deref() != Some(machine.as_str()) {
        stored.machine = Some(machine.clone());
        save_needed = true;
    }

    if save_needed {
        settings::save_backup_settings(&args.storage, &stored)?;
    }

    let (user, passphrase) =
        cli::resolve_credentials(args.user.clone(), args.passphrase.clone(), args.environment)?;

    Ok((
        server,
        port,
        BackupContext {
            user,
            passphrase,
            machine,
            months,
            days,
            assume_yes: args.yes,
            assume_no: args.no,
        },
    ))
}

fn run_backup_action(action: &str, args: cli::BackupArgs) -> Result<()> {
    args.validate(action)?;
    init_logging(&args.storage)?;

    let (server, port, context) = resolve_backup_settings(&args)?;
    let store = ProxyStore::new(&server, port);
    let center: Arc<Center<Progress>> = Arc::new(Center::new());
    let printer = spawn_progress_printer(center.new_channel());

    let result = perform_action(action, &args, &context, &store, &center);

    // flush queued writes before the process can exit
    store.shutdown();
    store.join();
    center.shutdown();
    center.join();
    let _ = printer.join();

    result
}

fn perform_action(
    action: &str,
    args: &cli::BackupArgs,
    context: &BackupContext,
    store: &dyn BlockStore,
    center: &Arc<Center<Progress>>,
) -> Result<()> {
    let ask = |prompt: &str| cli::confirm(prompt);
    let mut record = backup::load_settings(context, store, Some(&ask))?;

    let changed = match action {
        "add" => backup::add_sources(&mut record, context, &args.source)?,
        "remove" => backup::remove_sources(&mut record, context, &args.source)?,
        "list" => {
            for line in backup::list_sources(&record, context) {
                println!("{line}");
            }

            false
        }
        "backup" => {
            let options = BundleOptions {
                workers: num_cpus::get().min(4),
                ..BundleOptions::default()
            };
            backup::run_backup(&mut record, context, store, Some(center.as_ref()), &options)?
        }
        "restore" => {
            backup::run_restore(
                &record,
                context,
                store,
                Some(center.as_ref()),
                &args.source,
                args.destination.as_deref(),
            )?;
            false
        }
        other => {
            return Err(LibernetError::Invariant(format!(
                "unknown action: {other}"
            )))
        }
    };

    if changed {
        backup::save(&mut record, context, store)?;
    }

    Ok(())
}

/// Render per-file progress to stderr at a steady cadence.
fn spawn_progress_printer(channel: Channel<Progress>) -> std::thread::JoinHandle<()> {
    const UPDATE_PERIOD: Duration = Duration::from_millis(500);

    std::thread::spawn(move || {
        let mut need_newline = false;
        let mut file_count: u64 = 0;
        let mut total_bytes: u64 = 0;
        let mut last_file: Option<String> = None;
        let mut last_printed: Option<String> = None;
        let start = Instant::now();
        let mut last_update = Instant::now();

        loop {
            match channel.receive(UPDATE_PERIOD) {
                Ok(None) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Some(Progress::Source(path))) => {
                    if need_newline {
                        eprintln!();
                        need_newline = false;
                    }

                    eprintln!("{path}");
                    last_file = None;
                    continue;
                }
                Ok(Some(Progress::File(path))) => {
                    file_count += 1;
                    last_file = Some(path);
                }
                Ok(Some(Progress::Data(bytes))) => total_bytes += bytes,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if last_update.elapsed() < UPDATE_PERIOD {
                continue;
            }

            if last_file != last_printed {
                if need_newline {
                    eprintln!();
                    need_newline = false;
                }

                if let Some(file) = &last_file {
                    eprintln!("\t {file}");
                }

                last_printed = last_file.clone();
            }

            last_update = Instant::now();
            let elapsed = start.elapsed().as_secs_f64().max(0.001);
            let file_rate = file_count as f64 / elapsed;
            let data_rate = total_bytes as f64 / elapsed / 1024.0 / 1024.0;
            let gib = total_bytes as f64 / 1024.0 / 1024.0 / 1024.0;
            eprint!("\r\t {file_count:9} files {file_rate:4.1}/sec {gib:7.3} GiB {data_rate:5.1} MiB/sec");
            need_newline = true;
        }

        if need_newline {
            eprintln!();
        }
    })
}
