//! services/gateway/src/bin/gateway.rs
//!
//! Terminal front end: every subcommand builds the gateway context from the
//! configured state directory, runs one operation and exits.

use clap::{Parser, Subcommand};
use gateway_core::domain::{
    ComplianceState, LoginProof, Principal, Registration, ScrollPosition, SessionStatus, ToolOutput,
    ToolRequest, UploadFile, PDF_MIME,
};
use gateway_lib::{
    config::Config,
    error::GatewayError,
    gateway::{actions::GateOutcome, GatewayContext, Stores},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gateway", about = "Session, quota and agreement gateway for the PDF tools backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show who is signed in, the guest identity and the active document.
    Status,
    /// Sign in with email and password.
    Login {
        #[arg(long)]
        email: String,
        /// Read from standard input when omitted.
        #[arg(long, env = "GATEWAY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Sign in with an identity provider token.
    LoginGoogle {
        #[arg(long)]
        id_token: String,
    },
    /// Create an account. Accepts the agreement as part of sign-up.
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "GATEWAY_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    Logout,
    DeleteAccount,
    /// Show the remaining guest quota.
    Usage,
    /// Read and accept (or decline) the user agreement.
    Eula,
    /// Merge two or more PDFs.
    Merge {
        #[arg(required = true, num_args = 2..)]
        files: Vec<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Extract pages, e.g. `--pages 1-3,5`.
    Extract {
        file: PathBuf,
        #[arg(long)]
        pages: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Reorder pages, e.g. `--order 3,1,2`.
    Reorder {
        file: PathBuf,
        #[arg(long)]
        order: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Convert a PDF to plain text.
    Convert {
        file: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Summarize a PDF.
    Summarize {
        file: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Inspect or drop the active document.
    Document {
        #[command(subcommand)]
        action: DocumentAction,
    },
}

#[derive(Subcommand)]
enum DocumentAction {
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    info!("Configuration loaded. State directory: {}", config.state_dir.display());

    // --- 2. Build the Gateway Context ---
    let stores = Stores::open(&config.state_dir, config.session_idle_timeout)?;
    let ctx = GatewayContext::connect(config, stores)?;
    let status = ctx.start().await;

    // --- 3. Run the Command ---
    match cli.command {
        Command::Status => show_status(&ctx, &status).await,
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => prompt("Password: ").await?,
            };
            let session = ctx
                .session
                .login(LoginProof::Credentials { email, password })
                .await?;
            println!("Signed in as {}", display_name(&session.user_id, &session.email));
            if !session.eula_accepted {
                println!("The user agreement is pending. Run `gateway eula` to review it.");
            }
        }
        Command::LoginGoogle { id_token } => {
            let session = ctx
                .session
                .login(LoginProof::IdentityProvider { id_token })
                .await?;
            println!("Signed in as {}", display_name(&session.user_id, &session.email));
        }
        Command::Register {
            username,
            email,
            password,
        } => {
            let password = match password {
                Some(password) => password,
                None => prompt("Password: ").await?,
            };
            ctx.session
                .register(Registration {
                    username,
                    email,
                    password,
                })
                .await?;
            println!("Account created. Sign in with `gateway login`.");
        }
        Command::Logout => {
            ctx.session.sign_out();
            println!("Signed out.");
        }
        Command::DeleteAccount => {
            let answer = prompt("Delete the account permanently? [y/N] ").await?;
            if answer.eq_ignore_ascii_case("y") {
                ctx.session.delete_account().await?;
                println!("Account deleted.");
            }
        }
        Command::Usage => show_usage(&ctx).await?,
        Command::Eula => review_agreement(&ctx, &status).await?,
        Command::Merge { files, out } => {
            let mut uploads = Vec::with_capacity(files.len());
            for path in &files {
                uploads.push(read_upload(path).await?);
            }
            run_tool(&ctx, ToolRequest::Merge { files: uploads }, out).await?;
        }
        Command::Extract { file, pages, out } => {
            let request = ToolRequest::ExtractPages {
                file: read_upload(&file).await?,
                page_range: pages,
            };
            run_tool(&ctx, request, out).await?;
        }
        Command::Reorder { file, order, out } => {
            let request = ToolRequest::Reorder {
                file: read_upload(&file).await?,
                page_numbers: order,
            };
            run_tool(&ctx, request, out).await?;
        }
        Command::Convert { file, out } => {
            let request = ToolRequest::ConvertText {
                file: read_upload(&file).await?,
            };
            run_tool(&ctx, request, out).await?;
        }
        Command::Summarize { file, out } => {
            let request = ToolRequest::Summarize {
                file: read_upload(&file).await?,
            };
            run_tool(&ctx, request, out).await?;
        }
        Command::Document { action } => match action {
            DocumentAction::Show => match ctx.documents.current() {
                Some(doc) => println!("{} ({}, {} bytes)", doc.name, doc.mime, doc.bytes.len()),
                None => println!("No active document."),
            },
            DocumentAction::Clear => {
                ctx.documents.clear();
                println!("Active document cleared.");
            }
        },
    }

    Ok(())
}

fn display_name(user_id: &str, email: &Option<String>) -> String {
    match email {
        Some(email) => format!("{} ({})", email, user_id),
        None => user_id.to_string(),
    }
}

async fn show_status(ctx: &GatewayContext, status: &SessionStatus) {
    if matches!(status, SessionStatus::Resolving) {
        println!("Session not resolved yet.");
    }
    match ctx.principal().await {
        Some(Principal::Authenticated {
            user_id,
            eula_accepted,
            ..
        }) => {
            let email = status.session().and_then(|session| session.email.clone());
            println!("Signed in as {}", display_name(&user_id, &email));
            println!(
                "User agreement: {}",
                if eula_accepted { "accepted" } else { "pending" }
            );
        }
        Some(Principal::Guest { guest_id }) => println!("Browsing as guest {}", guest_id),
        None => println!("Not signed in. No guest session yet."),
    }
    match ctx.documents.current() {
        Some(doc) => println!("Active document: {} ({} bytes)", doc.name, doc.bytes.len()),
        None => println!("No active document."),
    }
}

async fn show_usage(ctx: &GatewayContext) -> Result<(), GatewayError> {
    if ctx.credentials.is_authenticated() {
        println!("Signed-in users have no usage limit.");
        return Ok(());
    }
    let guest_id = ctx.guests.get_or_create_guest_id().await?;
    let check = ctx.guests.check_usage(&guest_id).await?;
    println!(
        "{} used, {} remaining. {}",
        check.usage_count, check.remaining_usage, check.message
    );
    Ok(())
}

/// Shows the agreement, waits out the dwell time and asks for a decision.
async fn review_agreement(
    ctx: &GatewayContext,
    status: &SessionStatus,
) -> Result<(), GatewayError> {
    ctx.compliance.observe(status).await;
    let Some(modal) = ctx.compliance.state().modal().cloned() else {
        println!("Nothing to accept.");
        return Ok(());
    };

    println!("{}\n", modal.agreement_text);
    // The whole text has been printed, which counts as reading it to the end.
    ctx.compliance.report_scroll(ScrollPosition {
        scroll_top: 0.0,
        scroll_height: 0.0,
        client_height: 0.0,
    });

    println!(
        "Please take a moment to read it. You can accept in {} seconds.",
        modal.time_left
    );
    let mut states = ctx.compliance.subscribe();
    states
        .wait_for(|state| match state {
            ComplianceState::Blocked(modal) => modal.time_left == 0,
            _ => true,
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let answer = prompt("Accept the user agreement? [y/N] ").await?;
    if answer.eq_ignore_ascii_case("y") {
        ctx.compliance.accept().await?;
        println!("Agreement accepted.");
    } else {
        let next = ctx.compliance.decline();
        println!("Agreement declined. Signed out; sign in again at {}.", next);
    }
    Ok(())
}

async fn run_tool(
    ctx: &GatewayContext,
    request: ToolRequest,
    out: Option<PathBuf>,
) -> Result<(), GatewayError> {
    let pending = ctx
        .credentials
        .status()
        .session()
        .map(|session| !session.eula_accepted)
        .unwrap_or(false);
    if pending {
        println!("The user agreement is pending. Run `gateway eula` first.");
        return Ok(());
    }

    match ctx.actions.process(request).await? {
        GateOutcome::Completed(ToolOutput::Document(doc)) => {
            println!("{} is now the active document ({} bytes).", doc.name, doc.bytes.len());
            if let Some(path) = out {
                tokio::fs::write(&path, &doc.bytes).await?;
                println!("Saved to {}", path.display());
            }
        }
        GateOutcome::Completed(ToolOutput::Text(text)) => match out {
            Some(path) => {
                tokio::fs::write(&path, text.as_bytes()).await?;
                println!("Saved to {}", path.display());
            }
            None => println!("{}", text),
        },
        GateOutcome::LimitReached(check) => {
            if let Some(check) = check {
                println!("{}", check.message);
            }
            println!(
                "The guest limit has been reached. Sign in to continue ({}).",
                ctx.quota.redirect_to_login()
            );
        }
    }
    Ok(())
}

async fn read_upload(path: &Path) -> Result<UploadFile, GatewayError> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());
    let mime = if name.to_lowercase().ends_with(".pdf") {
        PDF_MIME.to_string()
    } else {
        "application/octet-stream".to_string()
    };
    Ok(UploadFile {
        name,
        mime,
        bytes: bytes.into(),
    })
}

async fn prompt(label: &str) -> Result<String, GatewayError> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(line.trim().to_string())
}
