//! Per-round inspection of the acquisition scores.
//!
//! `beta_sweep` shows which pair the rank-fusion score would pick as the
//! uncertainty weight shrinks, and `score_table` lays out every candidate's
//! prediction next to its rank-fusion and UCB scores. Both can be written as
//! TSV files for plotting.

use crate::iterate::RoundState;
use crate::regressor::{ModelError, Regressor};
use crate::scoring::{ScoringError, ScoringPolicy, argmax, score};
use crate::types::{Catalog, PairIndex, Prediction};
use ndarray::ArrayView1;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Betas swept by `beta_sweep` when diagnosing a round.
pub const DEFAULT_SWEEP_BETAS: [f64; 10] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
/// UCB weights reported by `score_table` when diagnosing a round.
pub const DEFAULT_UCB_BETAS: [f64; 3] = [1e5, 5e5, 1e6];

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("{ids} identifiers were supplied for {predictions} predictions.")]
    LengthMismatch { ids: usize, predictions: usize },
    #[error("Scoring failed: {0}")]
    Scoring(#[from] ScoringError),
    #[error("Prediction over the unknown pool failed: {0}")]
    Model(#[from] ModelError),
    #[error("Failed to write a diagnostics table: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The rank-fusion argmax at one beta.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepEntry {
    pub beta: f64,
    pub position: usize,
    pub predicted: f64,
    pub observed: Option<f64>,
}

/// One candidate's line in a score table.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreRow {
    pub id: PairIndex,
    pub predicted: f64,
    pub variance: f64,
    /// Rank-fusion score at beta 1.
    pub rank_score: f64,
    /// UCB score for each of the table's betas, in the same order.
    pub ucb_scores: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScoreTable {
    pub ucb_betas: Vec<f64>,
    pub rows: Vec<ScoreRow>,
}

/// For each beta, the position the rank-fusion score ranks highest.
///
/// `truth`, when given, must line up with the prediction rows.
pub fn beta_sweep(
    prediction: &Prediction,
    truth: Option<ArrayView1<f64>>,
    betas: &[f64],
) -> Result<Vec<SweepEntry>, DiagnosticsError> {
    if let Some(truth) = truth.as_ref() {
        if truth.len() != prediction.len() {
            return Err(DiagnosticsError::LengthMismatch {
                ids: truth.len(),
                predictions: prediction.len(),
            });
        }
    }

    let mut entries = Vec::with_capacity(betas.len());
    for &beta in betas {
        let scores = score(
            prediction.values(),
            prediction.variances(),
            ScoringPolicy::RankFusion { beta },
        )?;
        let Some(position) = argmax(scores.view()) else {
            break;
        };
        entries.push(SweepEntry {
            beta,
            position,
            predicted: prediction.values[position],
            observed: truth.as_ref().map(|t| t[position]),
        });
    }
    Ok(entries)
}

pub fn score_table(
    prediction: &Prediction,
    ids: &[PairIndex],
    ucb_betas: &[f64],
) -> Result<ScoreTable, DiagnosticsError> {
    if ids.len() != prediction.len() {
        return Err(DiagnosticsError::LengthMismatch {
            ids: ids.len(),
            predictions: prediction.len(),
        });
    }

    let rank = score(
        prediction.values(),
        prediction.variances(),
        ScoringPolicy::default(),
    )?;
    let ucb = ucb_betas
        .iter()
        .map(|&beta| {
            score(
                prediction.values(),
                prediction.variances(),
                ScoringPolicy::Ucb { beta },
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let rows = ids
        .iter()
        .enumerate()
        .map(|(i, &id)| ScoreRow {
            id,
            predicted: prediction.values[i],
            variance: prediction.variances[i],
            rank_score: rank[i],
            ucb_scores: ucb.iter().map(|column| column[i]).collect(),
        })
        .collect();

    Ok(ScoreTable {
        ucb_betas: ucb_betas.to_vec(),
        rows,
    })
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<std::fs::File>, DiagnosticsError> {
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
}

/// Writes a score table with chemical and protein names resolved from `catalog`.
pub fn write_score_table(
    path: &Path,
    table: &ScoreTable,
    catalog: &Catalog,
) -> Result<(), DiagnosticsError> {
    let mut writer = tsv_writer(path)?;

    let mut header = vec![
        "chemical".to_string(),
        "protein".to_string(),
        "predicted".to_string(),
        "variance".to_string(),
        "rank_score".to_string(),
    ];
    header.extend(table.ucb_betas.iter().map(|b| format!("ucb_{b:e}")));
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![
            catalog.chemical_name(&row.id).to_string(),
            catalog.protein_name(&row.id).to_string(),
            row.predicted.to_string(),
            row.variance.to_string(),
            row.rank_score.to_string(),
        ];
        record.extend(row.ucb_scores.iter().map(|s| s.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_beta_sweep(
    path: &Path,
    entries: &[SweepEntry],
    ids: &[PairIndex],
    catalog: &Catalog,
) -> Result<(), DiagnosticsError> {
    let mut writer = tsv_writer(path)?;
    writer.write_record(["beta", "chemical", "protein", "predicted", "observed"])?;
    for entry in entries {
        let id = ids
            .get(entry.position)
            .ok_or(DiagnosticsError::LengthMismatch {
                ids: ids.len(),
                predictions: entry.position + 1,
            })?;
        writer.write_record([
            entry.beta.to_string(),
            catalog.chemical_name(id).to_string(),
            catalog.protein_name(id).to_string(),
            entry.predicted.to_string(),
            entry.observed.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Predicts over the unknown pool and writes both tables for `round` into `dir`.
///
/// Returns the paths written, score table first.
pub fn diagnose_round(
    regressor: &dyn Regressor,
    state: &RoundState,
    round: usize,
    dir: &Path,
) -> Result<(PathBuf, PathBuf), DiagnosticsError> {
    let unknown = &state.unknown;
    let prediction = regressor.predict(unknown.features())?;

    let sweep = beta_sweep(&prediction, unknown.labels(), &DEFAULT_SWEEP_BETAS)?;
    for entry in &sweep {
        match entry.observed {
            Some(kd) => log::debug!("beta: {}, Kd: {}", entry.beta, kd),
            None => log::debug!("beta: {}, predicted Kd: {:.3}", entry.beta, entry.predicted),
        }
    }
    let table = score_table(&prediction, unknown.ids(), &DEFAULT_UCB_BETAS)?;

    std::fs::create_dir_all(dir)?;
    let stem = format!("round{:03}_{}", round, regressor.name());
    let scores_path = dir.join(format!("{stem}_scores.tsv"));
    let sweep_path = dir.join(format!("{stem}_beta_sweep.tsv"));
    write_score_table(&scores_path, &table, &state.catalog)?;
    write_beta_sweep(&sweep_path, &sweep, unknown.ids(), &state.catalog)?;
    Ok((scores_path, sweep_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use tempfile::tempdir;

    fn prediction() -> Prediction {
        // A confident moderate pair at 1 against a strong but uncertain pair at 2.
        Prediction::new(array![1.0, 7.0, 8.0, 2.0], array![0.4, 0.01, 3.0, 0.2])
    }

    fn catalog() -> Catalog {
        Catalog {
            chemicals: vec!["imatinib".to_string(), "dasatinib".to_string()],
            proteins: vec!["ABL1".to_string(), "KIT".to_string()],
            chemical_features: Array2::zeros((2, 1)),
            protein_features: Array2::zeros((2, 1)),
        }
    }

    fn ids() -> Vec<PairIndex> {
        vec![
            PairIndex::new(0, 0),
            PairIndex::new(0, 1),
            PairIndex::new(1, 0),
            PairIndex::new(1, 1),
        ]
    }

    #[test]
    fn test_beta_sweep_moves_from_confident_to_top_value() {
        let truth = array![1.5, 6.5, 8.5, 2.5];
        let sweep = beta_sweep(&prediction(), Some(truth.view()), &[1.0, 2.0, 10.0]).unwrap();

        assert_eq!(sweep.len(), 3);
        assert_eq!(sweep[0].position, 1);
        assert_eq!(sweep[0].observed, Some(6.5));
        assert_eq!(sweep[1].position, 2);
        assert_eq!(sweep[2].position, 2);
        assert_eq!(sweep[2].predicted, 8.0);
    }

    #[test]
    fn test_beta_sweep_without_truth_and_mismatched_truth() {
        let sweep = beta_sweep(&prediction(), None, &DEFAULT_SWEEP_BETAS).unwrap();
        assert_eq!(sweep.len(), 10);
        assert!(sweep.iter().all(|e| e.observed.is_none()));

        let short = array![1.0];
        assert!(matches!(
            beta_sweep(&prediction(), Some(short.view()), &[1.0]),
            Err(DiagnosticsError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_score_table_columns() {
        let table = score_table(&prediction(), &ids(), &[1.0, 10.0]).unwrap();
        assert_eq!(table.rows.len(), 4);

        let strong = &table.rows[2];
        assert_eq!(strong.id, PairIndex::new(1, 0));
        assert_abs_diff_eq!(strong.ucb_scores[0], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(strong.ucb_scores[1], -22.0, epsilon = 1e-12);
        // Value rank 4 plus variance rank 1.
        assert_abs_diff_eq!(strong.rank_score, 5.0, epsilon = 1e-12);

        assert!(matches!(
            score_table(&prediction(), &ids()[..2], &DEFAULT_UCB_BETAS),
            Err(DiagnosticsError::LengthMismatch { ids: 2, predictions: 4 })
        ));
    }

    #[test]
    fn test_tables_are_written_as_tsv() {
        let dir = tempdir().unwrap();
        let table = score_table(&prediction(), &ids(), &DEFAULT_UCB_BETAS).unwrap();
        let path = dir.path().join("scores.tsv");
        write_score_table(&path, &table, &catalog()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "chemical\tprotein\tpredicted\tvariance\trank_score\tucb_1e5\tucb_5e5\tucb_1e6"
        );
        assert!(lines.next().unwrap().starts_with("imatinib\tABL1\t1\t0.4\t"));
        assert_eq!(text.lines().count(), 5);

        let sweep = beta_sweep(&prediction(), None, &[1.0]).unwrap();
        let sweep_path = dir.path().join("sweep.tsv");
        write_beta_sweep(&sweep_path, &sweep, &ids(), &catalog()).unwrap();
        let text = std::fs::read_to_string(&sweep_path).unwrap();
        assert_eq!(text.lines().nth(1).unwrap(), "1\timatinib\tKIT\t7\t");
    }
}
