//! reprise CLI - builds and tests FreeBSD ports in disposable jails.

use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use reprise::cli::Cli;
use reprise::executor::Executor;
use reprise::generate::generate_jobs;
use reprise::job::JobRunner;
use reprise::repository::{RepositoryManager, RepositoryUpdateMode};
use reprise::types::{JobResult, JobSpec, JobStatus};
use reprise::workdir::Workdir;
use reprise::{config, profiling};

const PACKAGE_REPOSITORY_ROOT: &str = "https://pkg.freebsd.org";
const REPOSITORY_AUTO_UPDATE_PERIOD: Duration = Duration::from_secs(24 * 3600);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    profiling::init();
    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_timer(profiling::ElapsedTimer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install logging subscriber")?;

    let config = config::load_config(cli.config.as_deref()).context("failed to load config file")?;

    let executor = Arc::new(Executor::new());

    let jobspecs = generate_jobs(&executor, &cli, &config)
        .await
        .context("failed to generate jobs")?;

    if jobspecs.is_empty() {
        println!("nothing to do");
        return Ok(ExitCode::FAILURE);
    }

    if !cli.quiet {
        print_summary(&jobspecs);
    }

    if cli.dry_run {
        return Ok(ExitCode::SUCCESS);
    }

    let workdir = Arc::new(
        Workdir::initialize(executor.clone(), None)
            .await
            .context("failed to initialize workdir")?,
    );

    let repository_manager = Arc::new(RepositoryManager::new(
        workdir.root().get_path()?.join("packages"),
        PACKAGE_REPOSITORY_ROOT.to_string(),
        REPOSITORY_AUTO_UPDATE_PERIOD,
    ));

    let update_mode = if cli.no_repo_update {
        RepositoryUpdateMode::Disable
    } else if cli.force_repo_update {
        RepositoryUpdateMode::Force
    } else {
        RepositoryUpdateMode::Auto
    };

    let runner = JobRunner::new(executor.clone(), workdir.clone(), repository_manager.clone(), update_mode);

    let mut results = Vec::with_capacity(jobspecs.len());
    for jobspec in jobspecs {
        let result = runner.run(jobspec).await;
        let failed = !result.status.is_success();
        results.push(result);
        if failed && cli.fail_fast {
            break;
        }
    }

    if !cli.quiet {
        print_results(&results)?;
    }

    let success = results.iter().all(|r| r.status.is_success());
    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_summary(specs: &[JobSpec]) {
    eprintln!("Job summary:");
    for spec in specs {
        eprintln!(" * {spec}");
    }
    eprintln!("{} job(s) total", specs.len());
}

fn print_results(results: &[JobResult]) -> Result<()> {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);

    println!("Job results:");
    let mut num_successes = 0;
    for result in results {
        let (label, color) = match result.status {
            JobStatus::Success => {
                num_successes += 1;
                ("     SUCCESS", Color::Green)
            }
            JobStatus::FetchFailed | JobStatus::FetchTimeout => ("FETCH FAILED", Color::Red),
            JobStatus::BuildFailed | JobStatus::BuildTimeout => ("BUILD FAILED", Color::Red),
            JobStatus::TestFailed | JobStatus::TestTimeout => (" TEST FAILED", Color::Yellow),
            JobStatus::Crashed => ("     CRASHED", Color::Magenta),
            JobStatus::Skipped => ("     SKIPPED", Color::Magenta),
        };

        stdout.set_color(ColorSpec::new().set_fg(Some(color)))?;
        write!(stdout, "{label}")?;
        stdout.reset()?;
        write!(stdout, " {}", result.spec)?;
        if let Some(log_path) = &result.log_path {
            write!(stdout, ", log: ")?;
            stdout.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
            write!(stdout, "{}", log_path.display())?;
            stdout.reset()?;
        }
        writeln!(stdout)?;
    }

    let success = num_successes == results.len();
    stdout.set_color(ColorSpec::new().set_fg(Some(if success { Color::Green } else { Color::Red })))?;
    write!(stdout, "{num_successes}/{}", results.len())?;
    stdout.reset()?;
    writeln!(stdout, " successful jobs")?;

    Ok(())
}
