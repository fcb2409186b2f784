mod cli;

use anyhow::{Result, bail};
use chrono::Local;
use clap::Parser;
use cli::{Cli, Commands};
use std::fs;
use std::io::Write;
use std::panic;
use std::sync::Arc;
use to_cloud::backend::Backends;
use to_cloud::backend::local::open_local;
use to_cloud::backend::rest::{RestBackend, RestSettings};
use to_cloud::config::{BackendKind, Config, ENV_ANON_KEY, ENV_URL};
use to_cloud::controller::{ControllerSettings, Mutation, TodoController};
use to_cloud::notice::NoticeKind;
use to_cloud::todo::ImageUpload;
use to_cloud::utils::paths::{ensure_data_dir_exists, get_crash_log_path, get_logs_dir, get_session_path};

/// Install a panic hook that writes crash information to a log file
fn install_crash_handler() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        if let Ok(crash_log_path) = get_crash_log_path() {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            let mut crash_report = format!("=== CRASH at {} ===\n", timestamp);

            if let Some(message) = panic_info.payload().downcast_ref::<&str>() {
                crash_report.push_str(&format!("Message: {}\n", message));
            } else if let Some(message) = panic_info.payload().downcast_ref::<String>() {
                crash_report.push_str(&format!("Message: {}\n", message));
            }

            if let Some(location) = panic_info.location() {
                crash_report.push_str(&format!(
                    "Location: {}:{}:{}\n",
                    location.file(),
                    location.line(),
                    location.column()
                ));
            }

            crash_report.push_str(&format!("\nBacktrace:\n{}\n\n", std::backtrace::Backtrace::force_capture()));

            if let Some(parent) = crash_log_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Ok(mut file) = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&crash_log_path)
            {
                let _ = file.write_all(crash_report.as_bytes());
                eprintln!("\nCrash logged to: {}", crash_log_path.display());
            }
        }

        default_hook(panic_info);
    }));
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize file-based logging.
///
/// Logs are written to ~/.to-cloud/logs/tocloud.log, rolling daily.
/// Log level can be controlled with RUST_LOG env var (default: info).
fn init_file_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = get_logs_dir().ok()?;

    if let Err(e) = fs::create_dir_all(&logs_dir) {
        eprintln!("Warning: Could not create logs directory: {}", e);
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "tocloud.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Some(guard)
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_backends(config: &Config) -> Result<Backends> {
    match config.backend {
        BackendKind::Local => {
            let data_dir = ensure_data_dir_exists()?;
            let (auth, store, storage) = open_local(&data_dir)?;
            Ok(Backends::new(Arc::new(auth), Arc::new(store), Arc::new(storage)))
        }
        BackendKind::Remote => {
            if !config.has_remote_credentials() {
                tracing::warn!("remote backend selected without credentials");
                bail!(
                    "Missing backend credentials. Set {ENV_URL} and {ENV_ANON_KEY}, \
                     or run `tocloud configure --url <URL> --anon-key <KEY>`"
                );
            }
            let backend = RestBackend::new(RestSettings::from(&config.remote), Some(get_session_path()?))?;
            Ok(Backends::from_shared(Arc::new(backend)))
        }
    }
}

/// Print the outcome of a mutation. Remote failures arrive as notices.
fn report<T>(outcome: Mutation<T>, success: impl FnOnce(T) -> String) {
    match outcome {
        Mutation::Applied(value) => println!("✓ {}", success(value)),
        Mutation::Rejected(rejection) => println!("Nothing changed: {rejection}"),
        Mutation::RolledBack(_) => {}
    }
}

/// Runs one command. Returns whether the list should be printed afterwards.
async fn run_command(controller: &TodoController, command: Commands) -> Result<bool> {
    match command {
        Commands::List => {}
        Commands::Add { text, image } => {
            let upload = image.as_deref().map(ImageUpload::from_path).transpose()?;
            report(controller.create(&text, upload).await, |created| {
                if created.is_partial() {
                    format!("Todo #{} added without its image", created.item.id)
                } else {
                    format!("Todo #{} added", created.item.id)
                }
            });
        }
        Commands::Toggle { id } => {
            report(controller.toggle_complete(id).await, |completed| {
                let state = if completed { "done" } else { "not done" };
                format!("Todo #{id} marked {state}")
            });
        }
        Commands::Rename { id, text } => {
            if let Err(rejection) = controller.begin_edit(id) {
                println!("Nothing changed: {rejection}");
            } else {
                controller.set_edit_text(&text).ok();
                report(controller.save_edit().await, |text| format!("Todo #{id} renamed to \"{text}\""));
            }
        }
        Commands::Delete { id } => {
            report(controller.delete(id).await, |()| format!("Todo #{id} deleted"));
        }
        Commands::Attach { id, path } => {
            let upload = ImageUpload::from_path(&path)?;
            report(controller.attach_image(id, upload).await, |image| {
                format!("Image attached to todo #{id}: {}", image.url)
            });
        }
        Commands::Detach { id } => {
            report(controller.detach_image(id).await, |()| format!("Image removed from todo #{id}"));
        }
        // Failures of account requests are reported through notices
        Commands::Login { email, password } => {
            let _ = controller.sign_in(&email, &password).await;
        }
        Commands::Signup { email, password } => {
            let _ = controller.sign_up(&email, &password).await;
        }
        Commands::ResetPassword { email } => {
            let _ = controller.request_password_reset(&email).await;
            return Ok(false);
        }
        Commands::Logout => {
            let _ = controller.sign_out().await;
        }
        Commands::Whoami => {
            match controller.principal() {
                Some(user) => println!("{} ({})", user.email.as_deref().unwrap_or("no email"), user.id),
                None => println!("Not signed in"),
            }
            return Ok(false);
        }
        Commands::Configure { .. } => return Ok(false),
    }
    Ok(true)
}

fn print_notices(controller: &TodoController) {
    for notice in controller.take_notices() {
        match notice.kind {
            NoticeKind::Error => eprintln!("{notice}"),
            NoticeKind::Success | NoticeKind::Info => println!("{notice}"),
        }
    }
}

fn print_list(controller: &TodoController) {
    let items = controller.items();
    if items.is_empty() {
        if let Some(hint) = controller.empty_hint() {
            println!("{hint}");
        }
        return;
    }

    println!("\n📋 Todo List ({} of {} done)\n", controller.completed_count(), items.len());

    for item in &items {
        let mark = if item.completed { "[x]" } else { "[ ]" };
        println!("{:>4}. {} {}", item.id.0, mark, item.text);
        if let Some(image) = &item.image {
            println!("        🖼  {}", image.url);
        }
    }

    println!();
}

fn handle_configure(
    mut config: Config,
    backend: Option<BackendKind>,
    url: Option<String>,
    anon_key: Option<String>,
) -> Result<()> {
    if let Some(backend) = backend {
        config.backend = backend;
    }
    if let Some(url) = url {
        config.remote.url = url.trim().to_string();
    }
    if let Some(anon_key) = anon_key {
        config.remote.anon_key = anon_key.trim().to_string();
    }
    config.save()?;

    println!("✓ Configuration saved (backend: {})", config.backend);
    if config.backend == BackendKind::Remote && !config.has_remote_credentials() {
        println!("Warning: the remote backend still needs a URL and an anonymous key");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    install_crash_handler();

    let cli = Cli::parse();

    // Guard must be kept alive for the duration of the program
    let _log_guard = if cli.verbose {
        init_stderr_logging();
        None
    } else {
        init_file_logging()
    };

    let mut config = Config::load()?;
    let command = cli.command.unwrap_or(Commands::List);

    if let Commands::Configure { url, anon_key } = command {
        return handle_configure(config, cli.backend, url, anon_key);
    }

    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    tracing::info!(backend = %config.backend, "tocloud starting");

    let controller = TodoController::new(open_backends(&config)?, ControllerSettings::from(&config));
    if command.needs_list() {
        controller.mount().await;
    }

    let show_list = run_command(&controller, command).await?;
    print_notices(&controller);
    if show_list {
        print_list(&controller);
    }

    controller.unmount().await;
    Ok(())
}
