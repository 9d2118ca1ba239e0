use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};

use rbacscan::analyze::AnalyzeOptions;
use rbacscan::app::AppSession;
use rbacscan::config::ClientConfig;
use rbacscan::error::{ClientError, Result};
use rbacscan::logging::init_tracing;
use rbacscan::models::{format_timestamp, ManifestFile, PlanId, Report};
use rbacscan::profile::{AvatarUpload, ProfileEdit};
use rbacscan::render::{render_text, OutputFormat};
use rbacscan::session::{GuardDecision, Page, Route};
use rbacscan::workflow::{LoadOutcome, ReportDownload};

#[derive(Parser)]
#[command(name = "rbacscan")]
#[command(about = "Client for the RBAC scanning service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Backend base URL
    #[arg(short, long, env = "RBACSCAN_URL")]
    url: Option<String>,

    /// Local store directory
    #[arg(long, env = "RBACSCAN_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        #[arg(short, long, default_value = "")]
        org: String,
    },
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    Logout,
    /// Show the signed-in user, organisation and plan
    Me,
    Clusters,
    CreateCluster {
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Scan history of a cluster, newest first
    Scans {
        #[arg(short, long)]
        cluster: String,
    },
    Upload {
        #[arg(short, long)]
        cluster: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    Report {
        #[arg(short, long)]
        cluster: String,
        /// Defaults to the first history row
        #[arg(short, long)]
        scan: Option<String>,
        #[arg(long, conflicts_with = "scan")]
        latest: bool,
        /// With --raw: print every line
        #[arg(long)]
        expand: bool,
        #[arg(long, conflicts_with = "raw")]
        html: bool,
        /// Pretty JSON instead of the grant listing
        #[arg(long)]
        raw: bool,
    },
    Download {
        #[arg(short, long)]
        cluster: String,
        #[arg(short, long)]
        scan: Option<String>,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// One-off analysis, no session required
    Analyze {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long, default_value = "")]
        namespace: String,
        #[arg(long)]
        danger_only: bool,
        #[arg(long)]
        html: bool,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    Show,
    Set {
        /// Left unchanged when omitted
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        bio: Option<String>,
        /// Image file; its extension picks the MIME type
        #[arg(short, long)]
        avatar: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    Users,
    Orgs,
    SetAdmin {
        #[arg(short, long)]
        user: String,
        #[arg(action = ArgAction::Set)]
        admin: bool,
    },
    SetPlan {
        #[arg(short, long)]
        org: String,
        plan: PlanId,
    },
}

impl Commands {
    fn page(&self) -> Page {
        match self {
            Commands::Register { .. } => Page::Register,
            Commands::Login { .. } => Page::Login,
            Commands::Analyze { .. } => Page::Analyze,
            Commands::Admin { .. } => Page::Admin,
            _ => Page::Home,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match ClientConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(url) = cli.url {
        config.base_url = url;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let _guard = init_tracing("rbacscan", config.log_json, config.log_dir.as_deref());

    let page = cli.command.page();
    let app = match AppSession::open(config, page) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("cannot open local store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match app.guard.check() {
        GuardDecision::Proceed(_) => {}
        GuardDecision::Redirect(route) => {
            eprintln!("{}", redirect_message(page, route));
            return ExitCode::from(2);
        }
    }

    match run(&app, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match app.route_for(&e) {
                Some(route) => eprintln!("{}", redirect_message(page, route)),
                None => eprintln!("error: {e}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// What a guard redirect means for the command that was run.
fn redirect_message(page: Page, route: Route) -> &'static str {
    match (page, route) {
        (_, Route::Login) => "Not signed in. Run `rbacscan login --email <EMAIL> --password <PASSWORD>`.",
        (Page::Login | Page::Register, Route::Home) => "Already signed in; run `rbacscan logout` first.",
        (Page::Admin, Route::Home) => "This needs an administrator account.",
        (_, Route::Home) => "Permission denied.",
        (_, Route::Admin) => "Signed in as administrator; see `rbacscan admin --help`.",
    }
}

fn read_manifest(path: &Path) -> Result<ManifestFile> {
    let bytes = fs::read(path).map_err(|e| ClientError::validation(format!("{}: {e}", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rbac.yaml".to_string());
    Ok(ManifestFile::new(name, bytes))
}

fn write_download(dl: &ReportDownload, out: Option<PathBuf>) -> Result<()> {
    let path = out.unwrap_or_else(|| PathBuf::from(&dl.file_name));
    fs::write(&path, &dl.bytes).map_err(|e| ClientError::validation(format!("{}: {e}", path.display())))?;
    println!("Saved {} ({} bytes)", path.display(), dl.bytes.len());
    Ok(())
}

fn print_counts(report: &Report) {
    let c = report.counts();
    println!(
        "subjects: {}  grants: {}  permissions: {}  dangerous grants: {}",
        c.subjects, c.roles, c.perms, c.danger_roles
    );
}

fn avatar_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Select the cluster, then the requested scan (or keep the default first row).
async fn open_scan(app: &AppSession, cluster: &str, scan: Option<&str>) -> Result<()> {
    app.workflow.select_cluster(cluster).await?;
    if let Some(scan) = scan {
        app.workflow.select_scan(scan)?;
    }
    Ok(())
}

async fn run(app: &AppSession, command: Commands) -> Result<()> {
    match command {
        Commands::Register { email, password, org } => {
            let claims = app.register(&email, &password, &org).await?;
            println!("Registered {} (user {})", claims.email, claims.sub);
        }
        Commands::Login { email, password } => {
            let claims = app.login(&email, &password).await?;
            println!(
                "Logged in as {}{}",
                claims.email,
                if claims.is_admin { " (admin)" } else { "" }
            );
        }
        Commands::Logout => {
            app.logout();
            println!("Logged out.");
        }
        Commands::Me => {
            let info = app.load_me().await?;
            println!("{}", app.status());
            println!("user: {}", info.user_id);
            if let Some(claims) = app.session().claims() {
                println!("email: {}{}", claims.email, if claims.is_admin { " (admin)" } else { "" });
            }
            if let Some(org) = info.org {
                println!("org: {} ({})", org.name, org.id);
            }
            if let Some(sub) = info.sub {
                println!("plan: {} [{}]", sub.plan_id, sub.status);
            }
        }
        Commands::Clusters => {
            let clusters = app.catalog.load().await?;
            println!("{}", app.catalog.status());
            for c in clusters {
                if c.notes.is_empty() {
                    println!("{}  {}", c.id, c.name);
                } else {
                    println!("{}  {}  ({})", c.id, c.name, c.notes);
                }
            }
        }
        Commands::CreateCluster { name, notes } => {
            let cluster = app.catalog.create(&name, &notes).await?;
            println!("{}: {} {}", app.catalog.status(), cluster.id, cluster.name);
        }
        Commands::Scans { cluster } => {
            app.workflow.select_cluster(&cluster).await?;
            println!("{}", app.workflow.history_meta());
            for row in app.workflow.history() {
                println!(
                    "{} {}  {}  {}",
                    if row.selected { "*" } else { " " },
                    row.scan.id,
                    format_timestamp(&row.scan.created_at),
                    row.scan.source
                );
            }
        }
        Commands::Upload { cluster, file } => {
            let manifest = read_manifest(&file)?;
            app.workflow.select_cluster(&cluster).await?;
            let scan = app.workflow.upload_scan(Some(&manifest)).await?;
            println!("{}: {}", app.workflow.status().scan, scan.id);
            if let Some(summary) = app.workflow.summary() {
                let c = summary.counts;
                println!(
                    "subjects: {}  grants: {}  permissions: {}  dangerous grants: {}  risk: {:.1}",
                    c.subjects, c.roles, c.perms, c.danger_roles, summary.risk_score
                );
            }
        }
        Commands::Report {
            cluster,
            scan,
            latest,
            expand,
            html,
            raw,
        } => {
            open_scan(app, &cluster, scan.as_deref()).await?;
            let outcome = if latest {
                app.workflow.load_latest_report().await?
            } else {
                app.workflow.load_report().await?
            };
            if outcome == LoadOutcome::Discarded {
                return Ok(());
            }
            let Some(cached) = app.workflow.cached_report() else {
                return Err(ClientError::validation("Load report first"));
            };
            if raw {
                if expand {
                    app.workflow.toggle_report_expansion();
                }
                if let Some(text) = app.workflow.report_text() {
                    println!("{}", text.text);
                }
            } else if html {
                print!("{}", render_text(&cached.report, OutputFormat::Html));
            } else {
                eprintln!("scan {}", cached.scan_id);
                print_counts(&cached.report);
                print!("{}", render_text(&cached.report, OutputFormat::Terminal));
            }
        }
        Commands::Download { cluster, scan, out } => {
            open_scan(app, &cluster, scan.as_deref()).await?;
            app.workflow.load_report().await?;
            write_download(&app.workflow.download_report()?, out)?;
        }
        Commands::Analyze {
            file,
            namespace,
            danger_only,
            html,
            out,
        } => {
            let manifest = read_manifest(&file)?;
            let opts = AnalyzeOptions { namespace, danger_only };
            let report = app.analyzer.analyze(Some(&manifest), &opts).await?;
            eprintln!("{}", app.analyzer.status());
            match out {
                Some(path) => write_download(&app.analyzer.download()?, Some(path))?,
                None if html => print!("{}", render_text(&report, OutputFormat::Html)),
                None => {
                    print_counts(&report);
                    print!("{}", render_text(&report, OutputFormat::Terminal));
                }
            }
        }
        Commands::Profile { command } => match command {
            ProfileCommands::Show => {
                let p = app.session().profile();
                println!("name: {}", p.name);
                println!("bio: {}", p.bio);
                println!("avatar: {}", if p.avatar.is_empty() { "none" } else { "set" });
            }
            ProfileCommands::Set { name, bio, avatar } => {
                let avatar = match avatar {
                    Some(path) => Some(AvatarUpload {
                        mime: avatar_mime(&path).to_string(),
                        bytes: fs::read(&path)
                            .map_err(|e| ClientError::validation(format!("{}: {e}", path.display())))?,
                    }),
                    None => None,
                };
                let p = app.session().save_profile(ProfileEdit { name, bio, avatar })?;
                println!("Saved profile for {}", if p.name.is_empty() { "you" } else { p.name.as_str() });
            }
        },
        Commands::Admin { command } => match command {
            AdminCommands::Users => {
                let users = app.admin.load_users().await?;
                println!("{}", app.admin.users_status());
                for u in users {
                    println!(
                        "{}  {}  {}  {}",
                        u.id,
                        u.email,
                        if u.is_admin { "admin" } else { "-" },
                        format_timestamp(&u.created_at)
                    );
                }
            }
            AdminCommands::Orgs => {
                let orgs = app.admin.load_orgs().await?;
                println!("{}", app.admin.orgs_status());
                for o in orgs {
                    println!(
                        "{}  {}  {}  {}  clusters {}/{}",
                        o.id, o.name, o.owner_email, o.plan_id, o.clusters_count, o.max_clusters
                    );
                }
            }
            AdminCommands::SetAdmin { user, admin } => {
                app.admin.load_users().await?;
                let u = app.admin.set_user_admin(&user, admin).await?;
                println!("{}: admin={}", u.email, u.is_admin);
            }
            AdminCommands::SetPlan { org, plan } => {
                app.admin.load_orgs().await?;
                let o = app.admin.set_org_plan(&org, plan).await?;
                println!("{}: plan={} (max clusters {})", o.name, o.plan_id, o.max_clusters);
            }
        },
    }
    Ok(())
}
