//! clinic - command-line client for the clinic management backend.
//!
//! Logs in once, keeps the session in the configured storage backend, and
//! refreshes the access token transparently on later runs.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clinic_core::api::{AppointmentQuery, InvoiceQuery, PatientQuery};
use clinic_core::auth::Navigator;
use clinic_core::{ApiClient, ApiError, Config};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable supplying the password for non-interactive login
const ENV_PASSWORD: &str = "CLINIC_PASSWORD";

/// Exit code for "log in again"
const EXIT_SESSION_EXPIRED: u8 = 2;

const USAGE: &str = "\
Usage: clinic <command> [args]

Commands:
  login [email]        Sign in (password from CLINIC_PASSWORD or prompt)
  logout               Sign out and forget the stored session
  whoami               Show the signed-in user
  patients [search]    List patients, optionally filtered
  appointments         List appointments
  invoices [--overdue] List invoices
";

/// Initialize the tracing subscriber: stderr plus a daily log file.
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=clinic_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match Config::cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "clinic.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Tells the user when the session has been torn down.
struct CliNavigator {
    login_route: String,
}

impl Navigator for CliNavigator {
    fn navigate(&self, route: &str) {
        debug!(route, "Navigate");
        if route == self.login_route {
            eprintln!("Your session has ended. Run `clinic login` to sign in again.");
        }
    }
}

enum Command {
    Login(Option<String>),
    Logout,
    WhoAmI,
    Patients(Option<String>),
    Appointments,
    Invoices { overdue_only: bool },
    Help,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let rest = args.get(1..).unwrap_or_default();
        let command = match rest.first().map(String::as_str) {
            Some("login") => Command::Login(rest.get(1).cloned()),
            Some("logout") => Command::Logout,
            Some("whoami") => Command::WhoAmI,
            Some("patients") => {
                let search = rest[1..].join(" ");
                Command::Patients((!search.is_empty()).then_some(search))
            }
            Some("appointments") => Command::Appointments,
            Some("invoices") => Command::Invoices {
                overdue_only: rest.iter().any(|a| a == "--overdue"),
            },
            None | Some("help") | Some("-h") | Some("--help") => Command::Help,
            Some(other) => anyhow::bail!("Unknown command '{}'\n\n{}", other, USAGE),
        };
        Ok(command)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    // Before loading config so its warnings are reported
    let _guard = init_tracing();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let args: Vec<String> = std::env::args().collect();
    match run(config, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<ApiError>() {
            Some(api_error) if api_error.is_session_expired() => {
                eprintln!("Error: {}", api_error);
                ExitCode::from(EXIT_SESSION_EXPIRED)
            }
            _ => {
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(mut config: Config, args: &[String]) -> Result<()> {
    let command = Command::parse(args)?;
    if let Command::Help = command {
        print!("{}", USAGE);
        return Ok(());
    }

    let navigator = Arc::new(CliNavigator {
        login_route: config.login_route.clone(),
    });
    let client = ApiClient::from_config(&config, navigator)?;
    info!(api = %config.api_base_url, "clinic starting");

    match command {
        Command::Login(email) => login(&client, &mut config, email).await,
        Command::Logout => {
            if !client.store().is_authenticated() {
                println!("Not logged in.");
                return Ok(());
            }
            client.auth().logout().await;
            println!("Logged out.");
            Ok(())
        }
        Command::WhoAmI => {
            match client.store().user() {
                Some(user) => {
                    println!("{} <{}>", user.name, user.email.as_deref().unwrap_or("no email"));
                    println!("role: {}", user.role);
                }
                None if client.store().is_authenticated() => println!("Logged in (no profile stored)"),
                None => println!("Not logged in."),
            }
            Ok(())
        }
        Command::Patients(search) => {
            let query = PatientQuery {
                search,
                ..Default::default()
            };
            let page = client.list_patients(&query).await?;
            for patient in &page.items {
                println!(
                    "{:<38} {:<36} {:<10} {}",
                    patient.id,
                    patient.full_name(),
                    patient.birth_date,
                    patient.phone
                );
            }
            println!("{} of {} patients", page.items.len(), page.total);
            Ok(())
        }
        Command::Appointments => {
            let page = client.list_appointments(&AppointmentQuery::default()).await?;
            for appt in &page.items {
                let patient = appt
                    .patient
                    .as_ref()
                    .map(|p| format!("{} {}", p.last_name, p.first_name))
                    .unwrap_or_else(|| appt.patient_id.clone());
                println!(
                    "{}  {:<12} {}",
                    appt.scheduled_start.format("%Y-%m-%d %H:%M"),
                    appt.status,
                    patient
                );
            }
            println!("{} of {} appointments", page.items.len(), page.total);
            Ok(())
        }
        Command::Invoices { overdue_only } => {
            let query = InvoiceQuery {
                overdue_only,
                ..Default::default()
            };
            let page = client.list_invoices(&query).await?;
            for invoice in &page.items {
                println!(
                    "{:<16} due {}  {:>10.2} of {:>10.2}  {:?}",
                    invoice.invoice_number,
                    invoice.due_date,
                    invoice.balance_due,
                    invoice.total_amount,
                    invoice.status
                );
            }
            println!("{} of {} invoices", page.items.len(), page.total);
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

async fn login(client: &ApiClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password(format!("Password for {}: ", email))
            .context("Failed to read password")?,
    };

    let user = client.auth().login(&email, &password).await?;
    println!("Logged in as {} ({})", user.name, user.role);

    if config.last_email.as_deref() != Some(email.as_str()) {
        Config::remember_email(&email).context("Failed to save config")?;
        config.last_email = Some(email);
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("No input given");
    }
    Ok(value)
}
