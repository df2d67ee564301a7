use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use spicy::config::{self, commands as store, AuthType, ConnectionProfile, Protocol};
use spicy::error::{AppError, SerializableError};
use spicy::events::TracingSink;
use spicy::logging::{self, commands as logs, LogFilter};
use spicy::proxmox::{commands as cluster, Credentials, PowerAction, StatusMap};
use spicy::ssh::{commands as shell, terminal, ShellState};
use spicy::AppState;
use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "spicy", version, about = "SPICE, RDP and SSH connections with Proxmox VE integration")]
struct Cli {
    /// Config directory (defaults to the platform config dir)
    #[arg(long, global = true, env = "SPICY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// More log output; repeat for debug
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print results and errors as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List stored connections
    List,
    /// Show one connection
    Show { id: String },
    /// Add a connection
    Add(AddArgs),
    /// Delete a connection
    Delete { id: String },
    /// Delete every connection
    Clear {
        #[arg(long)]
        yes: bool,
    },
    /// Import connections from an exported JSON file
    Import {
        file: PathBuf,
        /// Replace the store instead of merging
        #[arg(long)]
        replace: bool,
        #[arg(long)]
        yes: bool,
    },
    /// Export connections as JSON
    Export { file: Option<PathBuf> },
    /// Discover VMs on a Proxmox host
    Scan {
        #[arg(long)]
        host: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "SPICY_PASSWORD")]
        password: String,
        /// API port stored on imported profiles
        #[arg(long)]
        port: Option<u16>,
        /// Import the discovered VMs as SPICE connections
        #[arg(long)]
        import: bool,
    },
    /// Show VM status for Proxmox connections
    Status {
        /// Keep polling until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Send a power action to a VM
    Power {
        id: String,
        #[arg(value_enum)]
        action: PowerArg,
        #[arg(long)]
        yes: bool,
    },
    /// Open a SPICE console or RDP session
    Launch {
        id: String,
        /// Print the descriptor instead of starting the viewer
        #[arg(long)]
        print: bool,
    },
    /// Interactive SSH shell
    Shell { id: String },
    /// Show recent log lines
    Logs {
        #[arg(long, default_value_t = 200)]
        max: u32,
        /// Only lines for this profile or session
        #[arg(long)]
        session: Option<String>,
        /// Print the log directory and exit
        #[arg(long)]
        path: bool,
    },
}

#[derive(Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    host: String,
    #[arg(long, value_enum)]
    protocol: ProtocolArg,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, value_enum, default_value = "none")]
    auth: AuthArg,
    #[arg(long)]
    username: Option<String>,
    #[arg(long, env = "SPICY_PASSWORD")]
    password: Option<String>,
    /// Private key file; its contents are stored with the profile
    #[arg(long)]
    key_file: Option<PathBuf>,
    #[arg(long)]
    domain: Option<String>,
    #[arg(long)]
    node: Option<String>,
    #[arg(long)]
    vmid: Option<u32>,
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Spice,
    Rdp,
    Ssh,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Spice => Protocol::Spice,
            ProtocolArg::Rdp => Protocol::Rdp,
            ProtocolArg::Ssh => Protocol::Ssh,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AuthArg {
    None,
    Password,
    KeyFile,
    Proxmox,
}

impl From<AuthArg> for AuthType {
    fn from(arg: AuthArg) -> Self {
        match arg {
            AuthArg::None => AuthType::None,
            AuthArg::Password => AuthType::Password,
            AuthArg::KeyFile => AuthType::KeyFile,
            AuthArg::Proxmox => AuthType::ProxmoxApi,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PowerArg {
    Start,
    Stop,
    Reset,
    Shutdown,
}

impl From<PowerArg> for PowerAction {
    fn from(arg: PowerArg) -> Self {
        match arg {
            PowerArg::Start => PowerAction::Start,
            PowerArg::Stop => PowerAction::Stop,
            PowerArg::Reset => PowerAction::Reset,
            PowerArg::Shutdown => PowerAction::Shutdown,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "spicy=info,warn",
        1 => "spicy=debug,info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    if let Err(err) = run(cli).await {
        match err.downcast_ref::<AppError>() {
            Some(app) if json => {
                let envelope = SerializableError::from(app);
                println!("{}", serde_json::to_string(&envelope).unwrap_or_default());
            }
            _ => eprintln!("error: {:#}", err),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => config::get_config_dir()?,
    };
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating {}", config_dir.display()))?;
    tracing::debug!("Spicy config dir: {:?}", config_dir);

    logging::init_log_manager(config_dir.join("logs"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log manager: {}", e))?;

    let state = AppState::new(config_dir, Arc::new(TracingSink))?;
    let out = Output { json: cli.json };

    match cli.command {
        Cmd::List => {
            let profiles = store::list_profiles(&state);
            if out.json {
                return out.value(&profiles);
            }
            for p in &profiles {
                println!("{}", profile_line(p));
            }
            if profiles.is_empty() {
                println!("No connections");
            }
        }
        Cmd::Show { id } => out.value(&store::get_profile(&state, &id)?)?,
        Cmd::Add(args) => {
            let profile = build_profile(args)?;
            let saved = store::save_profile(&state, profile)?;
            out.done(&saved, &format!("Added '{}' ({})", saved.name, saved.id))?;
        }
        Cmd::Delete { id } => {
            let removed = store::delete_profile(&state, &id)?;
            out.done(&removed, &format!("Deleted '{}'", removed.name))?;
        }
        Cmd::Clear { yes } => {
            let count = store::list_profiles(&state).len();
            if !yes && !confirm(&format!("Delete all {} connections?", count))? {
                bail!("aborted");
            }
            store::clear_profiles(&state)?;
            out.done(&count, &format!("Deleted {} connections", count))?;
        }
        Cmd::Import { file, replace, yes } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            if replace {
                if !yes && !confirm("Replace every stored connection with the file's contents?")? {
                    bail!("aborted");
                }
                let count = store::replace_profiles(&state, &content)?;
                out.done(&count, &format!("Replaced store with {} connections", count))?;
            } else {
                let summary = store::import_profiles(&state, &content)?;
                out.done(
                    &summary,
                    &format!("Imported {} connections, skipped {} duplicates", summary.added, summary.skipped),
                )?;
            }
        }
        Cmd::Export { file } => {
            let content = store::export_profiles(&state)?;
            match file {
                Some(path) => {
                    std::fs::write(&path, content)?;
                    eprintln!("Exported to {}", path.display());
                }
                None => println!("{}", content),
            }
        }
        Cmd::Scan {
            host,
            username,
            password,
            port,
            import,
        } => {
            let creds = Credentials::new(host, username, password);
            let vms = cluster::scan_node(&state, &creds).await?;
            if import {
                let summary = cluster::import_discovered(&state, &creds, port, &vms)?;
                out.done(
                    &summary,
                    &format!("Found {} VMs, imported {}, skipped {}", vms.len(), summary.added, summary.skipped),
                )?;
            } else if out.json {
                out.value(&vms)?;
            } else {
                for vm in &vms {
                    println!(
                        "{:>6}  {:<24} {:<10} {}",
                        vm.vmid,
                        vm.name.as_deref().unwrap_or("-"),
                        vm.status.as_deref().unwrap_or("-"),
                        vm.node.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
        Cmd::Status { watch } => {
            if watch {
                watch_status(&state, &out).await?;
            } else {
                let report = cluster::poll_once(&state).await;
                for host in &report.hosts_failed {
                    eprintln!("warning: polling {} failed", host);
                }
                print_status(&state, &out, &cluster::status_snapshot(&state))?;
            }
        }
        Cmd::Power { id, action, yes } => {
            let action = PowerAction::from(action);
            let profile = store::get_profile(&state, &id)?;
            if matches!(action, PowerAction::Stop | PowerAction::Reset)
                && !yes
                && !confirm(&format!("{} '{}'?", action, profile.name))?
            {
                bail!("aborted");
            }
            let ack = cluster::power_action(&state, &id, action).await?;
            out.done(&ack, &format!("{} sent to '{}'", action, profile.name))?;
        }
        Cmd::Launch { id, print } => {
            let profile = store::get_profile(&state, &id)?;
            match profile.protocol {
                Protocol::Spice => {
                    let launch = cluster::launch_console(&state, &id, !print).await?;
                    for warning in &launch.output.warnings {
                        eprintln!("warning: {}", warning);
                    }
                    if print && !out.json {
                        print!("{}", launch.output.content);
                    } else {
                        let message = match &launch.file {
                            Some(file) => format!("Viewer started with {}", file.display()),
                            None => "Descriptor ready".to_string(),
                        };
                        out.done(&launch, &message)?;
                    }
                }
                Protocol::Rdp => {
                    cluster::launch_rdp(&state, &id)?;
                    out.done(&profile.id, &format!("RDP client started for {}", profile.host))?;
                }
                Protocol::Ssh => bail!("use `spicy shell {}` for SSH connections", id),
            }
        }
        Cmd::Shell { id } => run_shell(&state, &id).await?,
        Cmd::Logs { max, session, path } => {
            if path {
                println!("{}", logs::get_logs_dir()?);
                return Ok(());
            }
            let filter = session.map(|s| LogFilter {
                session_id: Some(s),
                ..Default::default()
            });
            let lines = logs::get_recent_logs(Some(max), filter)?;
            if out.json {
                return out.value(&lines);
            }
            for line in lines {
                let time = chrono::DateTime::from_timestamp_millis(line.timestamp)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{} {:<5} [{}] {}", time, line.level, line.subsystem, line.message);
            }
        }
    }

    Ok(())
}

struct Output {
    json: bool,
}

impl Output {
    fn value<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Terminal success line, or the result itself in JSON mode
    fn done<T: Serialize>(&self, value: &T, message: &str) -> anyhow::Result<()> {
        if self.json {
            self.value(value)
        } else {
            println!("{}", message);
            Ok(())
        }
    }
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    eprint!("{} [y/N] ", question);
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn profile_line(p: &ConnectionProfile) -> String {
    let target = match p.port {
        Some(port) => format!("{}:{}", p.host, port),
        None => p.host.clone(),
    };
    let vm = p.vmid.map(|v| format!(" vm {}", v)).unwrap_or_default();
    format!("{}  {:<5} {:<28} {}{}", p.id, p.protocol, p.name, target, vm)
}

fn build_profile(args: AddArgs) -> anyhow::Result<ConnectionProfile> {
    let mut profile = ConnectionProfile::new(args.name, args.host, args.protocol.into());
    profile.port = args.port;
    profile.auth_type = args.auth.into();
    profile.username = args.username;
    profile.password = args.password;
    profile.domain = args.domain;
    profile.node = args.node;
    profile.vmid = args.vmid;
    profile.tags = args.tags;
    if let Some(path) = args.key_file {
        profile.private_key = Some(
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        );
        profile.private_key_name = path.file_name().map(|n| n.to_string_lossy().to_string());
    }
    Ok(profile)
}

fn print_status(state: &AppState, out: &Output, snapshot: &StatusMap) -> anyhow::Result<()> {
    if out.json {
        return out.value(snapshot);
    }
    for p in store::list_profiles(state).iter().filter(|p| p.is_cluster_api()) {
        match snapshot.get(&p.id) {
            Some(record) => {
                let mem = if record.maxmem > 0 {
                    format!("{:.0}%", record.mem as f64 * 100.0 / record.maxmem as f64)
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<28} {:<10} cpu {:>5.1}%  mem {}",
                    p.name,
                    record.status,
                    record.cpu * 100.0,
                    mem
                );
            }
            None => println!("{:<28} unknown", p.name),
        }
    }
    Ok(())
}

async fn watch_status(state: &AppState, out: &Output) -> anyhow::Result<()> {
    let settings = state.settings.read().poller.clone();
    let cancel = CancellationToken::new();
    let mut updates = state.poller.subscribe();
    let Some(handle) = state.poller.clone().spawn(&settings, cancel.clone()) else {
        anyhow::bail!("status polling is disabled in config.toml ([poller] enabled = false)");
    };

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if !out.json {
                    println!("--- {}", chrono::Local::now().format("%H:%M:%S"));
                }
                print_status(state, out, &snapshot)?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    cancel.cancel();
    let _ = handle.await;
    Ok(())
}

async fn run_shell(state: &AppState, id: &str) -> anyhow::Result<()> {
    shell::attach_output(
        state,
        id,
        Arc::new(|data: &[u8]| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(data);
            let _ = stdout.flush();
        }),
    );
    let info = shell::connect_profile(state, id).await?;
    eprintln!(
        "Connected to {}@{}",
        info.username.as_deref().unwrap_or("?"),
        info.host.as_deref().unwrap_or("?")
    );
    let raw = terminal::RawMode::enable()?;

    let sessions = state.sessions.clone();
    let profile_id = id.to_string();
    let input = tokio::task::spawn_blocking(move || -> spicy::AppResult<()> {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            let n = stdin.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            sessions.send(&profile_id, &buf[..n])?;
        }
    });

    let sessions = state.sessions.clone();
    let profile_id = id.to_string();
    let closed = async move {
        loop {
            let current = sessions.get(&profile_id).map(|b| b.state());
            if !matches!(current, Some(ShellState::Ready | ShellState::Streaming)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };

    let resizes = terminal::forward_resizes(|cols, rows| {
        if let Err(e) = shell::resize_pty(state, id, cols, rows) {
            tracing::debug!("Resize not forwarded: {}", e);
        }
    });

    let outcome = tokio::select! {
        result = input => result.context("stdin relay failed").and_then(|r| r.map_err(Into::into)),
        _ = closed => Ok(()),
        _ = resizes => Ok(()),
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    shell::disconnect(state, id);
    drop(raw);
    eprintln!("Disconnected");
    outcome?;
    Ok(())
}
