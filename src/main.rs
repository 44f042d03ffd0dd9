use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use dimse::{MoveQuery, QueryLevel};
use pacs_retrieve::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "pacs-retrieve",
    about = "Retrieve studies from a PACS with C-MOVE into the local cache"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Query/Retrieve level (PATIENT, STUDY, SERIES or IMAGE)
    #[arg(short, long, default_value = "STUDY")]
    level: String,

    /// Study Instance UID
    #[arg(long)]
    study: Option<String>,

    /// Series Instance UID
    #[arg(long)]
    series: Option<String>,

    /// SOP Instance UID
    #[arg(long)]
    sop_instance: Option<String>,

    /// Extra identifier keys as `Keyword=value` or `GGGGEEEE=value`
    #[arg(short, long = "key")]
    keys: Vec<String>,
}

impl Cli {
    fn query(&self) -> anyhow::Result<MoveQuery> {
        let level: QueryLevel = self.level.parse()?;
        let mut query = MoveQuery::new(level);

        if let Some(uid) = &self.study {
            query = query.with_parameter("StudyInstanceUID", uid.as_str());
        }
        if let Some(uid) = &self.series {
            query = query.with_parameter("SeriesInstanceUID", uid.as_str());
        }
        if let Some(uid) = &self.sop_instance {
            query = query.with_parameter("SOPInstanceUID", uid.as_str());
        }
        for key in &self.keys {
            let Some((tag, value)) = key.split_once('=') else {
                bail!("--key expects tag=value, got '{}'", key);
            };
            query = query.with_parameter(tag.trim(), value.trim());
        }

        if query.parameters.is_empty() {
            bail!("nothing to retrieve: give --study, --series, --sop-instance or --key");
        }
        // catch unknown keywords before talking to the archive
        query.to_identifier()?;
        Ok(query)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    pacs_retrieve::init_logging(&config).context("initialising logging")?;

    let query = cli.query()?;
    let report = pacs_retrieve::run(&config, &query).await?;

    for entry in &report.objects {
        println!(
            "{}\t0x{:04X}\t{}",
            entry.sop_instance_uid,
            entry.status,
            entry.path.display()
        );
    }
    println!(
        "{}: {} object(s) retrieved from {}",
        report.outcome,
        report.objects.len(),
        config.archive
    );

    Ok(ExitCode::from(pacs_retrieve::exit_code(&report.outcome)))
}
