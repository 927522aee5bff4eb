use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use loadstorm::config::{FileConfig, LoggingConfig, Settings};
use loadstorm::controller::{InterruptSource, Trigger};
use loadstorm::report::{ReportFormat, Reporter};
use loadstorm::LoadTest;

#[derive(Parser)]
#[command(
    name = "loadstorm",
    about = "Concurrent HTTP load generator",
    version,
    long_about = None
)]
struct Cli {
    /// Target URL
    #[arg(short = 'u', long)]
    url: Option<String>,

    /// File with one target URL per line
    #[arg(short = 'f', long = "urls-file")]
    urls_file: Option<PathBuf>,

    /// HTTP method (forced to POST when --data is given)
    #[arg(short = 'm', long)]
    method: Option<String>,

    /// Number of concurrent clients [default: 100]
    #[arg(short = 'c', long)]
    clients: Option<usize>,

    /// Requests per client
    #[arg(short = 'r', long)]
    requests: Option<u64>,

    /// Test duration in seconds
    #[arg(short = 't', long)]
    period: Option<u64>,

    /// Read timeout in milliseconds [default: 5000]
    #[arg(long = "tr", visible_alias = "read-timeout")]
    read_timeout: Option<u64>,

    /// Write timeout in milliseconds [default: 5000]
    #[arg(long = "tw", visible_alias = "write-timeout")]
    write_timeout: Option<u64>,

    /// Reuse connections between requests (true/false) [default: true]
    #[arg(short = 'k', long = "keep-alive")]
    keep_alive: Option<bool>,

    /// Authorization header value
    #[arg(long)]
    auth: Option<String>,

    /// geolocation header value
    #[arg(long)]
    gl: Option<String>,

    /// Content-Type header value
    #[arg(long)]
    ct: Option<String>,

    /// apiUserName header value
    #[arg(long)]
    user: Option<String>,

    /// File whose contents are sent as the POST body
    #[arg(short = 'd', long)]
    data: Option<PathBuf>,

    /// Directory to capture failed responses into
    #[arg(long)]
    rsp: Option<PathBuf>,

    /// TOML config file (overrides LOADSTORM_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            url: self.url.clone(),
            urls_file: self.urls_file.clone(),
            method: self.method.clone(),
            clients: self.clients,
            requests: self.requests,
            period: self.period,
            read_timeout_ms: self.read_timeout,
            write_timeout_ms: self.write_timeout,
            keep_alive: self.keep_alive,
            authorization: self.auth.clone(),
            geolocation: self.gl.clone(),
            content_type: self.ct.clone(),
            api_user_name: self.user.clone(),
            data_file: self.data.clone(),
            capture_dir: self.rsp.clone(),
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print `message` and the usage text, then exit 1.
fn usage_exit(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {}\n", message);
    eprintln!("{}", Cli::command().render_help());
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match FileConfig::load_or_default(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => usage_exit(format!("{:#}", e)),
    };
    init_tracing(&file.logging);

    let resolved = match cli.settings().resolve(&file) {
        Ok(resolved) => resolved,
        Err(e) => usage_exit(e),
    };

    let test = LoadTest::new(resolved.run, resolved.template);
    let controller = test.controller(InterruptSource::Process);

    let outcome = match test.run(controller).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "run could not start");
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    };

    let format = if cli.json {
        ReportFormat::Json
    } else {
        ReportFormat::Text
    };
    let reporter = Reporter::new(format);
    let mut stdout = std::io::stdout().lock();
    reporter.emit(&outcome.summary, &mut stdout)?;
    stdout.flush()?;

    tracing::info!(
        run_id = %outcome.run_id,
        trigger = ?outcome.trigger,
        requests = outcome.summary.requests,
        "run finished"
    );

    // Workers of an interrupted run may still hold in-flight requests;
    // leave without unwinding them.
    if outcome.trigger != Trigger::Completed {
        std::process::exit(0);
    }
    Ok(())
}
