use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use devotional_pipeline::auth::{require_admin, Gate, SignInOutcome};
use devotional_pipeline::config::{self, Config};
use devotional_pipeline::generator::{AspectRatio, DevotionalRequest, GeminiClient, ImageSize};
use devotional_pipeline::library::Library;
use devotional_pipeline::model::{
    ChatMessage, Format, GeneratedContent, NewCalendarEntry, PipelineItem, Role, Session, Theme,
};
use devotional_pipeline::pipeline::{DueRun, ExpansionReport, Pipeline};
use devotional_pipeline::store::{Collection, Store};
use devotional_pipeline::studio::Studio;

#[derive(Debug, Parser)]
#[command(author, version, about = "Plan, generate, review and publish devotional content")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with email and password
    Login { email: String, password: String },
    /// Complete a sign-in with the emailed two-factor code
    Verify { code: String },
    Logout,
    /// Show the signed-in user
    Whoami,
    Signup { email: String, password: String },
    /// Mark an account's email as verified
    VerifyEmail { email: String },
    /// Change a user's role (admin only)
    Role { user_id: String, role: Role },
    /// List users (admin only)
    Users,

    /// Schedule a calendar entry
    Schedule {
        /// Date in YYYY-MM-DD
        date: NaiveDate,
        theme: Theme,
        verse: String,
        /// Requested formats, e.g. SMS,ImagePrompt
        #[arg(long, value_delimiter = ',', required = true)]
        formats: Vec<Format>,
    },
    /// List scheduled calendar entries
    Calendar,
    /// Remove a calendar entry without generating it
    Unschedule { entry_id: String },
    /// Generate content for one entry, or for every entry that is due
    Process {
        #[arg(long, conflicts_with = "due")]
        entry: Option<String>,
        #[arg(long)]
        due: bool,
    },
    /// List pipeline items
    Items,
    /// Generate a failed item again
    Retry { item_id: String },
    /// Regenerate a ready item with adjustment instructions
    Refine { item_id: String, instruction: String },
    Approve { item_id: String },
    /// Set distribution platforms for an item
    Platforms {
        item_id: String,
        #[arg(value_delimiter = ',')]
        platforms: Vec<String>,
    },
    Publish { item_id: String },
    Discard { item_id: String },

    /// List saved devotionals
    Library,
    /// List drafts
    Drafts,
    /// Generate a devotional outside the pipeline
    Studio {
        theme: Theme,
        verse: String,
        #[arg(long, default_value = "SocialPost")]
        format: Format,
        #[arg(long)]
        instruction: Option<String>,
        /// Keep the result as a draft
        #[arg(long)]
        save_draft: bool,
    },
    /// Ask the pastor a single question
    Ask { message: String },
    /// Generate a square image and print its data URI
    Image {
        prompt: String,
        /// 1K, 2K or 4K
        #[arg(long, default_value = "1K")]
        size: ImageSize,
    },
    /// Generate a video and print its URI
    Video {
        #[arg(default_value = "")]
        prompt: String,
        /// 16:9 or 9:16
        #[arg(long, default_value = "16:9")]
        aspect: AspectRatio,
        /// Image file to animate
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Edit an image file with an instruction and print the result's data URI
    EditImage { file: PathBuf, prompt: String },
    /// Run an analysis task over text or a text file
    Analyze {
        task: String,
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Print raw JSON for one collection, or for all of them
    Export { collection: Option<Collection> },
    /// Replace a collection with raw JSON read from a file
    Import { collection: Collection, file: PathBuf },
    #[command(subcommand)]
    Blacklist(BlacklistCommand),
}

#[derive(Debug, Subcommand)]
enum BlacklistCommand {
    Add { email: String },
    Remove { email: String },
    List,
}

struct App {
    store: Store,
    gate: Gate,
    cfg: Config,
}

impl App {
    fn pipeline(&self) -> Result<Pipeline> {
        let generator = GeminiClient::from_config(&self.cfg)?;
        Ok(Pipeline::new(self.store.clone(), Arc::new(generator)))
    }

    fn studio(&self) -> Result<Studio> {
        Ok(Studio::new(Arc::new(GeminiClient::from_config(&self.cfg)?)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = Store::connect(&cfg.database_url()).await?;
    let gate = Gate::from_config(store.clone(), &cfg);
    gate.ensure_master_admin(&cfg.admin.password).await?;
    gate.reap().await?;

    let app = App { store, gate, cfg };
    run(&app, args.command).await
}

async fn run(app: &App, command: Command) -> Result<()> {
    let session = app.gate.current_session().await?;
    let session = session.as_ref();

    match command {
        Command::Login { email, password } => {
            match app.gate.sign_in(&email, &password).await? {
                SignInOutcome::SignedIn(s) => println!("signed in as {} ({})", s.user.email, s.user.role.as_str()),
                SignInOutcome::TwoFactorRequired => {
                    println!("a verification code was sent; finish with `verify <code>`")
                }
            }
        }
        Command::Verify { code } => {
            let s = app.gate.verify_two_factor(&code).await?;
            println!("signed in as {} ({})", s.user.email, s.user.role.as_str());
        }
        Command::Logout => {
            app.gate.logout().await?;
            println!("signed out");
        }
        Command::Whoami => match session {
            Some(s) => print_session(s),
            None => println!("not signed in"),
        },
        Command::Signup { email, password } => {
            let user = app.gate.sign_up(&email, &password).await?;
            println!("created {} ({}); verify the email before signing in", user.email, user.id);
        }
        Command::VerifyEmail { email } => {
            if !app.gate.verify_email(&email).await? {
                bail!("no account for {email}");
            }
            println!("verified {email}");
        }
        Command::Role { user_id, role } => {
            if !app.gate.update_user_role(session, &user_id, role).await? {
                bail!("role unchanged for {user_id}");
            }
            println!("{user_id} is now {}", role.as_str());
        }
        Command::Users => {
            require_admin(session)?;
            for u in app.gate.users().await? {
                println!(
                    "{}  {:<32} {:<5} verified={} 2fa={}",
                    u.id,
                    u.email,
                    u.role.as_str(),
                    u.is_verified,
                    u.is_2fa_enabled
                );
            }
        }

        Command::Schedule {
            date,
            theme,
            verse,
            formats,
        } => {
            let entry = app
                .pipeline()?
                .schedule(
                    session,
                    NewCalendarEntry {
                        date,
                        theme,
                        verse,
                        formats,
                    },
                )
                .await?;
            println!("scheduled {} for {}", entry.id, entry.date);
        }
        Command::Calendar => {
            for e in app.pipeline()?.calendar().await? {
                let formats: Vec<&str> = e.requested_formats.iter().map(|f| f.as_str()).collect();
                println!("{}  {}  {:<14} {}  [{}]", e.id, e.date, e.theme, e.verse, formats.join(","));
            }
        }
        Command::Unschedule { entry_id } => {
            if !app.pipeline()?.unschedule(session, &entry_id).await? {
                bail!("no calendar entry {entry_id}");
            }
            println!("unscheduled {entry_id}");
        }
        Command::Process { entry, due } => {
            let pipeline = app.pipeline()?;
            let run = match (entry, due) {
                (Some(id), _) => DueRun {
                    expanded: vec![pipeline.expand(session, &id).await?],
                    ..Default::default()
                },
                (None, true) => pipeline.process_due(session, Utc::now().date_naive()).await?,
                (None, false) => bail!("pass --entry <id> or --due"),
            };
            if run.expanded.is_empty() && run.skipped.is_empty() {
                info!("nothing due");
            }
            for report in &run.expanded {
                print_report(report);
            }
            for (entry_id, err) in &run.skipped {
                println!("entry {entry_id}: skipped, {err}");
            }
        }
        Command::Items => {
            for item in app.pipeline()?.items().await? {
                print_item(&item);
            }
        }
        Command::Retry { item_id } => {
            let item = app.pipeline()?.retry(session, &item_id).await?;
            print_item(&item);
        }
        Command::Refine {
            item_id,
            instruction,
        } => {
            let item = app.pipeline()?.refine(session, &item_id, &instruction).await?;
            print_item(&item);
        }
        Command::Approve { item_id } => {
            let item = app.pipeline()?.approve(session, &item_id).await?;
            print_item(&item);
        }
        Command::Platforms {
            item_id,
            platforms,
        } => {
            let item = app
                .pipeline()?
                .set_platforms(session, &item_id, platforms)
                .await?;
            print_item(&item);
        }
        Command::Publish { item_id } => {
            let item = app.pipeline()?.publish(session, &item_id).await?;
            println!("published \"{}\" to the library", item.content.title);
        }
        Command::Discard { item_id } => {
            if !app.pipeline()?.discard(session, &item_id).await? {
                println!("no item {item_id}");
            }
        }

        Command::Library => {
            for c in Library::new(app.store.clone()).saved().await? {
                print_content(&c);
            }
        }
        Command::Drafts => {
            for c in Library::new(app.store.clone()).drafts().await? {
                print_content(&c);
            }
        }
        Command::Studio {
            theme,
            verse,
            format,
            instruction,
            save_draft,
        } => {
            let mut req = DevotionalRequest::new(theme, verse, format);
            if let Some(i) = instruction {
                req = req.with_instruction(i);
            }
            let content = app.studio()?.compose(&req).await?;
            println!("{}", serde_json::to_string_pretty(&content)?);
            if save_draft {
                Library::new(app.store.clone()).save_draft(&content).await?;
            }
        }
        Command::Ask { message } => {
            let mut history: Vec<ChatMessage> = Vec::new();
            let reply = app.studio()?.ask(&mut history, &message).await?;
            println!("{}", reply.text);
        }
        Command::Image { prompt, size } => {
            println!("{}", app.studio()?.image(&prompt, size).await?);
        }
        Command::Video {
            prompt,
            aspect,
            seed,
        } => {
            let seed = match seed {
                Some(path) => Some(read_image_uri(&path).await?),
                None => None,
            };
            let uri = app.studio()?.video(&prompt, aspect, seed.as_deref()).await?;
            println!("{uri}");
        }
        Command::EditImage { file, prompt } => {
            let image = read_image_uri(&file).await?;
            println!("{}", app.studio()?.edit_image(&image, &prompt).await?);
        }
        Command::Analyze { task, text, file } => {
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(file)) => tokio::fs::read_to_string(&file)
                    .await
                    .with_context(|| format!("failed to read {}", file.display()))?,
                (None, None) => bail!("pass --text or --file"),
            };
            println!("{}", app.studio()?.analyze(&text, &task).await?);
        }

        Command::Export { collection } => {
            // Exports include password hashes.
            require_admin(session)?;
            match collection {
                Some(collection) => match app.store.export_raw(collection).await? {
                    Some(raw) => println!("{raw}"),
                    None => println!("[]"),
                },
                None => {
                    for (collection, raw) in app.store.export_all().await? {
                        println!("{}\t{raw}", collection.key());
                    }
                }
            }
        }
        Command::Import { collection, file } => {
            require_admin(session)?;
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            app.store.import_raw(collection, &raw).await?;
            println!("imported {}", collection.name());
        }
        Command::Blacklist(cmd) => match cmd {
            BlacklistCommand::Add { email } => {
                if !app.gate.add_to_blacklist(session, &email).await? {
                    println!("{email} not added");
                }
            }
            BlacklistCommand::Remove { email } => {
                app.gate.remove_from_blacklist(session, &email).await?;
            }
            BlacklistCommand::List => {
                for email in app.gate.blacklist().await? {
                    println!("{email}");
                }
            }
        },
    }
    Ok(())
}

/// Read an image file into a `data:` URI, guessing the mime type from the extension.
async fn read_image_uri(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let mime = match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Ok(format!(
        "data:{mime};base64,{}",
        general_purpose::STANDARD.encode(bytes)
    ))
}

fn print_session(s: &Session) {
    println!(
        "{} ({}) until {}",
        s.user.email,
        s.user.role.as_str(),
        s.expires_at.format("%Y-%m-%d %H:%M UTC")
    );
}

fn print_item(item: &PipelineItem) {
    let platforms = item.platforms.as_deref().unwrap_or_default().join(",");
    println!(
        "{}  {:<10} {:<12} {}  {}",
        item.id, item.status, item.format, item.content.title, platforms
    );
    if let Some(err) = &item.error {
        println!("    error: {err}");
    }
}

fn print_content(c: &GeneratedContent) {
    println!("{} ({})", c.title, c.bible_verse);
}

fn print_report(report: &ExpansionReport) {
    println!(
        "entry {}: {} item(s), {} failed",
        report.entry_id,
        report.items.len(),
        report.failures.len()
    );
    for f in &report.failures {
        println!("    {} {}: {}", f.item_id, f.format, f.message);
    }
}
