use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use fogagent_core::api::{ErrorBody, ReportIndex, SubmitResponse, WireEvent};
use fogagent_core::model::{Snapshot, StageReport, TargetKind};
use fogagent_core::now_ms;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "fogagentctl", about = "Submit batches to a fog agent and read its stage reports")]
struct Args {
    /// Base URL of the agent.
    #[arg(long, global = true, default_value = "http://127.0.0.1:20200")]
    agent: String,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Post a JSON array of `{timestamp, data}` events.
    Submit {
        #[arg(long, value_enum)]
        kind: Kind,
        #[arg(long)]
        file: String,
        /// Timestamps in the file are ms offsets from now.
        #[arg(long)]
        relative: bool,
    },
    /// Print one stage report.
    Report { stage: u64 },
    /// Print how many stages exist.
    Reports,
    /// Print the agent's current view of every target.
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Workload,
    Interface,
}

impl From<Kind> for TargetKind {
    fn from(k: Kind) -> Self {
        match k {
            Kind::Workload => TargetKind::Workload,
            Kind::Interface => TargetKind::Interface,
        }
    }
}

fn endpoint(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Workload => "application",
        TargetKind::Interface => "interface",
    }
}

/// Rewrites offset timestamps to absolute ms epochs relative to `base`.
fn shift_timestamps(events: &mut [WireEvent], base: i64) -> anyhow::Result<()> {
    for (i, ev) in events.iter_mut().enumerate() {
        let offset = match &ev.timestamp {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .with_context(|| format!("event {i}: timestamp is not an integer offset"))?;
        let at = base
            .checked_add(offset)
            .with_context(|| format!("event {i}: offset {offset} overflows the clock"))?;
        ev.timestamp = Some(Value::from(at));
    }
    Ok(())
}

async fn read<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let msg = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        bail!("agent answered {status}: {msg}");
    }
    Ok(resp.json().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.agent.trim_end_matches('/');

    match args.cmd {
        Cmd::Submit {
            kind,
            file,
            relative,
        } => {
            let bytes = tokio::fs::read(&file).await.context("read file")?;
            let mut events: Vec<WireEvent> =
                serde_json::from_slice(&bytes).context("parse json")?;
            if relative {
                shift_timestamps(&mut events, now_ms())?;
            }
            let url = format!("{}/{}", base, endpoint(kind.into()));
            let resp: SubmitResponse = read(client.post(url).json(&events).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Report { stage } => {
            let url = format!("{}/reports/{}", base, stage);
            let resp: StageReport = read(client.get(url).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Reports => {
            let url = format!("{}/reports", base);
            let resp: ReportIndex = read(client.get(url).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Cmd::Status => {
            let url = format!("{}/status", base);
            let resp: Snapshot = read(client.get(url).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
    }

    Ok(())
}
