#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use kinact::config::CampaignConfig;
use kinact::data;
use kinact::diagnostics::{DiagnosticsError, diagnose_round};
use kinact::iterate::{RoundObserver, RoundState, run_campaign};
use kinact::regressor::{Regressor, RegressorKind};
use kinact::select::Selection;

#[derive(Parser)]
#[command(
    name = "kinact",
    version,
    about = "Active-learning acquisition campaigns over chemical-kinase binding affinities"
)]
struct Cli {
    /// Regressor used to predict affinities: gp or ridge
    regressor: RegressorKind,

    /// Acquisition scheme: exploit, explore, quad, quadexplore, perprot or partition
    scheme: String,

    /// Campaign configuration TOML; defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write every acquired pair to this TSV file
    #[arg(long, value_name = "FILE")]
    ledger: Option<PathBuf>,

    /// Write per-round score tables and beta sweeps into this directory
    #[arg(long, value_name = "DIR")]
    diagnostics: Option<PathBuf>,
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rounds {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// One acquired pair as written to the ledger.
struct LedgerRow {
    round: usize,
    chemical: String,
    protein: String,
    predicted: f64,
    variance: f64,
    observed: Option<f64>,
}

/// Drives the progress bar, collects the ledger and writes diagnostics.
struct CampaignReporter {
    progress: ProgressBar,
    ledger: Vec<LedgerRow>,
    diagnostics_dir: Option<PathBuf>,
    diagnostics_error: Option<DiagnosticsError>,
}

impl RoundObserver for CampaignReporter {
    fn on_round_start(&mut self, round: usize, total_rounds: usize) {
        self.progress
            .set_message(format!("round {} of {}", round + 1, total_rounds));
    }

    fn on_trained(&mut self, round: usize, regressor: &dyn Regressor, state: &RoundState) {
        let Some(dir) = self.diagnostics_dir.as_deref() else {
            return;
        };
        if self.diagnostics_error.is_some() {
            return;
        }
        match diagnose_round(regressor, state, round, dir) {
            Ok((scores, sweep)) => log::debug!(
                "Wrote diagnostics to {} and {}",
                scores.display(),
                sweep.display()
            ),
            Err(e) => {
                log::warn!("Diagnostics for round {round} failed; skipping further diagnostics: {e}");
                self.diagnostics_error = Some(e);
            }
        }
    }

    fn on_round_complete(&mut self, round: usize, selection: &Selection, state: &RoundState) {
        for pick in &selection.picks {
            self.ledger.push(LedgerRow {
                round,
                chemical: state.catalog.chemical_name(&pick.id).to_string(),
                protein: state.catalog.protein_name(&pick.id).to_string(),
                predicted: pick.predicted,
                variance: pick.variance,
                observed: pick.observed,
            });
        }
        self.progress.inc(1);
    }
}

fn write_ledger(path: &Path, rows: &[LedgerRow]) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["round", "chemical", "protein", "predicted", "variance", "observed"])?;
    for row in rows {
        writer.write_record([
            row.round.to_string(),
            row.chemical.clone(),
            row.protein.clone(),
            row.predicted.to_string(),
            row.variance.to_string(),
            row.observed.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = match &cli.config {
        Some(path) => {
            log::info!("Reading configuration from '{}'", path.display());
            CampaignConfig::load(path)?
        }
        None => CampaignConfig::default(),
    };
    let scheme = config.scheme(&cli.scheme)?;
    let rounds = config.rounds_for(&scheme);
    let mut rng = StdRng::seed_from_u64(config.acquisition.seed);

    let state = data::process(&config, &mut rng)?;
    let mut regressor = cli
        .regressor
        .build(&config.model.gp, &config.model.ridge);

    log::info!(
        "Running {} rounds of '{}' acquisition with the {} regressor",
        rounds,
        scheme,
        regressor.name()
    );

    let mut reporter = CampaignReporter {
        progress: create_progress_bar(rounds as u64, &format!("{scheme} / {}", cli.regressor)),
        ledger: Vec::new(),
        diagnostics_dir: cli.diagnostics.clone(),
        diagnostics_error: None,
    };

    let outcome = run_campaign(
        state,
        regressor.as_mut(),
        &scheme,
        rounds,
        &mut rng,
        &mut reporter,
    );
    reporter.progress.finish_and_clear();
    let summary = outcome?;

    if let Some(path) = &cli.ledger {
        write_ledger(path, &reporter.ledger)?;
        log::info!(
            "Wrote {} acquisitions to '{}'",
            reporter.ledger.len(),
            path.display()
        );
    }
    if let Some(e) = reporter.diagnostics_error {
        return Err(Box::new(e));
    }

    if summary.exhausted {
        log::info!("Every candidate pair has been acquired.");
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Messages already embed their causes.
    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
