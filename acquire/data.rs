//! # Dataset Loading and Splitting
//!
//! Reads the three tab-separated inputs of a campaign, validates them against a
//! fixed schema, and splits the measured pairs into the initial observed pool
//! and the quadrant-labelled unknown pool.
//!
//! - `chemicals`: a `chemical` name column plus numeric feature columns.
//! - `proteins`: a `protein` name column plus numeric feature columns.
//! - `affinities`: `chemical`, `protein` and `kd` columns, one row per measured pair.
//!
//! Column names are fixed. Every feature column must be numeric, complete and
//! finite. A pair's feature row is its chemical's features followed by its
//! protein's features.

use crate::config::{CampaignConfig, DataConfig, LabelTransform, SplitConfig};
use crate::iterate::RoundState;
use crate::pool::{Pool, PoolError};
use crate::types::{Catalog, PairIndex, Quadrants};
use ahash::{AHashMap, AHashSet};
use ndarray::{Array1, Array2, s};
use polars::prelude::*;
use rand::Rng;
use rand::seq::index;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const CHEMICAL_COLUMN: &str = "chemical";
const PROTEIN_COLUMN: &str = "protein";
const KD_COLUMN: &str = "kd";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{column}' was not found in '{file}'. Please check spelling and case."
    )]
    ColumnNotFound { file: String, column: String },
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. Every row must be complete."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("'{file}' contains no data rows.")]
    EmptyTable { file: String },
    #[error("'{file}' has no numeric feature columns besides '{key}'.")]
    NoFeatureColumns { file: String, key: &'static str },
    #[error("The {kind} '{name}' is listed more than once.")]
    DuplicateEntity { kind: &'static str, name: String },
    #[error("The affinities file refers to the {kind} '{name}', which is not in the {kind} table.")]
    UnknownEntity { kind: &'static str, name: String },
    #[error("The pair {chemical} <--> {protein} has more than one affinity measurement.")]
    DuplicatePair { chemical: String, protein: String },
    #[error(
        "The pair {chemical} <--> {protein} has Kd {kd}, which cannot be log-transformed. Use label_transform = \"identity\" or remove the row."
    )]
    NonPositiveAffinity {
        chemical: String,
        protein: String,
        kd: f64,
    },
    #[error(
        "The split left no measured pair between known chemicals and known proteins, so there is nothing to train on. Increase the known fractions."
    )]
    EmptyObservedPool,
    #[error("Failed to assemble a pool: {0}")]
    Pool(#[from] PoolError),
}

/// The validated inputs of a campaign before they are split.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub catalog: Catalog,
    /// Measured pairs with their transformed labels, in file order.
    pub measurements: Vec<(PairIndex, f64)>,
}

impl Dataset {
    /// The feature row of every pair in `pairs`, stacked in order.
    pub fn pair_features(&self, pairs: &[PairIndex]) -> Array2<f64> {
        let n_chem = self.catalog.chemical_features.ncols();
        let mut features = Array2::zeros((pairs.len(), self.catalog.pair_width()));
        for (row, pair) in pairs.iter().enumerate() {
            features
                .slice_mut(s![row, ..n_chem])
                .assign(&self.catalog.chemical_features.row(pair.chemical));
            features
                .slice_mut(s![row, n_chem..])
                .assign(&self.catalog.protein_features.row(pair.protein));
        }
        features
    }
}

fn read_tsv(path: &Path) -> Result<DataFrame, DataError> {
    log::info!("Loading data from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    if df.height() == 0 {
        return Err(DataError::EmptyTable {
            file: path.display().to_string(),
        });
    }
    Ok(df)
}

fn require_columns(df: &DataFrame, path: &Path, required: &[&str]) -> Result<(), DataError> {
    let present: AHashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for column in required {
        if !present.contains(*column) {
            return Err(DataError::ColumnNotFound {
                file: path.display().to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn extract_string_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }
    let casted = series.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_no_null_iter()
        .map(|s| s.trim().to_string())
        .collect();
    Ok(values)
}

/// Reads an entity table: the `key` name column plus every other column as a feature.
pub fn load_entity_table(
    path: &Path,
    key: &'static str,
) -> Result<(Vec<String>, Array2<f64>), DataError> {
    let df = read_tsv(path)?;
    require_columns(&df, path, &[key])?;

    let names = extract_string_column(&df, key)?;
    let mut seen = AHashSet::with_capacity(names.len());
    for name in &names {
        if !seen.insert(name.as_str()) {
            return Err(DataError::DuplicateEntity {
                kind: key,
                name: name.clone(),
            });
        }
    }

    let feature_columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .filter(|c| c != key)
        .collect();
    if feature_columns.is_empty() {
        return Err(DataError::NoFeatureColumns {
            file: path.display().to_string(),
            key,
        });
    }

    let mut features = Array2::zeros((names.len(), feature_columns.len()));
    for (j, column) in feature_columns.iter().enumerate() {
        let values = extract_numeric_column(&df, column)?;
        features.column_mut(j).assign(&Array1::from_vec(values));
    }

    log::info!(
        "Loaded {} {}s with {} features each",
        names.len(),
        key,
        feature_columns.len()
    );
    Ok((names, features))
}

fn transform_label(
    kd: f64,
    transform: LabelTransform,
    chemical: &str,
    protein: &str,
) -> Result<f64, DataError> {
    match transform {
        LabelTransform::Identity => Ok(kd),
        LabelTransform::NegLog10 if kd > 0.0 => Ok(-kd.log10()),
        LabelTransform::NegLog10 => Err(DataError::NonPositiveAffinity {
            chemical: chemical.to_string(),
            protein: protein.to_string(),
            kd,
        }),
    }
}

/// Reads the affinities table and resolves names against the catalog.
pub fn load_affinities(
    path: &Path,
    catalog: &Catalog,
    transform: LabelTransform,
) -> Result<Vec<(PairIndex, f64)>, DataError> {
    let df = read_tsv(path)?;
    require_columns(&df, path, &[CHEMICAL_COLUMN, PROTEIN_COLUMN, KD_COLUMN])?;

    let chemicals = extract_string_column(&df, CHEMICAL_COLUMN)?;
    let proteins = extract_string_column(&df, PROTEIN_COLUMN)?;
    let kds = extract_numeric_column(&df, KD_COLUMN)?;

    let chemical_index: AHashMap<&str, usize> = catalog
        .chemicals
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let protein_index: AHashMap<&str, usize> = catalog
        .proteins
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();

    let mut measurements = Vec::with_capacity(kds.len());
    let mut seen = AHashSet::with_capacity(kds.len());
    for ((chemical, protein), kd) in chemicals.iter().zip(&proteins).zip(kds) {
        let c = *chemical_index
            .get(chemical.as_str())
            .ok_or_else(|| DataError::UnknownEntity {
                kind: CHEMICAL_COLUMN,
                name: chemical.clone(),
            })?;
        let p = *protein_index
            .get(protein.as_str())
            .ok_or_else(|| DataError::UnknownEntity {
                kind: PROTEIN_COLUMN,
                name: protein.clone(),
            })?;
        let id = PairIndex::new(c, p);
        if !seen.insert(id) {
            return Err(DataError::DuplicatePair {
                chemical: chemical.clone(),
                protein: protein.clone(),
            });
        }
        measurements.push((id, transform_label(kd, transform, chemical, protein)?));
    }

    log::info!("Loaded {} affinity measurements", measurements.len());
    Ok(measurements)
}

/// Loads and validates all three input tables.
pub fn load_dataset(config: &DataConfig) -> Result<Dataset, DataError> {
    let (chemicals, chemical_features) = load_entity_table(&config.chemicals, CHEMICAL_COLUMN)?;
    let (proteins, protein_features) = load_entity_table(&config.proteins, PROTEIN_COLUMN)?;
    let catalog = Catalog {
        chemicals,
        proteins,
        chemical_features,
        protein_features,
    };
    let measurements = load_affinities(&config.affinities, &catalog, config.label_transform)?;
    Ok(Dataset {
        catalog,
        measurements,
    })
}

fn known_mask<R: Rng>(n: usize, fraction: f64, rng: &mut R) -> Vec<bool> {
    let n_known = ((n as f64 * fraction).round() as usize).clamp(1, n.max(1));
    let mut mask = vec![false; n];
    if n > 0 {
        for i in index::sample(rng, n, n_known.min(n)) {
            mask[i] = true;
        }
    }
    mask
}

/// Splits the measured pairs into the initial round state.
///
/// A seeded random subset of chemicals and proteins is marked known. Pairs
/// between a known chemical and a known protein are observed; every other
/// measured pair is unknown and lands in exactly one quadrant.
pub fn split<R: Rng>(
    dataset: Dataset,
    split: &SplitConfig,
    rng: &mut R,
) -> Result<RoundState, DataError> {
    let known_chemicals = known_mask(
        dataset.catalog.chemicals.len(),
        split.known_chemical_fraction,
        rng,
    );
    let known_proteins = known_mask(
        dataset.catalog.proteins.len(),
        split.known_protein_fraction,
        rng,
    );

    let mut quadrants = Quadrants::default();
    let (mut observed_ids, mut observed_labels) = (Vec::new(), Vec::new());
    let (mut unknown_ids, mut unknown_labels) = (Vec::new(), Vec::new());

    for &(id, label) in &dataset.measurements {
        match (known_chemicals[id.chemical], known_proteins[id.protein]) {
            (true, true) => {
                observed_ids.push(id);
                observed_labels.push(label);
                continue;
            }
            (false, true) => quadrants.side.insert(id),
            (true, false) => quadrants.repurpose.insert(id),
            (false, false) => quadrants.novel.insert(id),
        };
        unknown_ids.push(id);
        unknown_labels.push(label);
    }

    if observed_ids.is_empty() {
        return Err(DataError::EmptyObservedPool);
    }

    log::info!(
        "{} observed pairs; {} unknown pairs (side {}, repurpose {}, novel {})",
        observed_ids.len(),
        unknown_ids.len(),
        quadrants.side.len(),
        quadrants.repurpose.len(),
        quadrants.novel.len()
    );

    let observed = Pool::new(
        dataset.pair_features(&observed_ids),
        Some(Array1::from_vec(observed_labels)),
        observed_ids,
    )?;
    let unknown = Pool::new(
        dataset.pair_features(&unknown_ids),
        Some(Array1::from_vec(unknown_labels)),
        unknown_ids,
    )?;

    Ok(RoundState {
        catalog: Arc::new(dataset.catalog),
        observed,
        unknown,
        quadrants: Some(Arc::new(quadrants)),
        partition: None,
    })
}

/// Loads the configured inputs and builds the first round's state.
pub fn process<R: Rng>(config: &CampaignConfig, rng: &mut R) -> Result<RoundState, DataError> {
    let dataset = load_dataset(&config.data)?;
    split(dataset, &config.split, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    struct Fixture {
        chemicals: NamedTempFile,
        proteins: NamedTempFile,
        affinities: NamedTempFile,
    }

    impl Fixture {
        fn config(&self, transform: LabelTransform) -> DataConfig {
            DataConfig {
                chemicals: self.chemicals.path().to_path_buf(),
                proteins: self.proteins.path().to_path_buf(),
                affinities: self.affinities.path().to_path_buf(),
                label_transform: transform,
            }
        }
    }

    /// Four chemicals and four proteins with every pair measured.
    fn complete_fixture() -> Fixture {
        let chemicals = create_test_tsv(
            "chemical\tlogp\tweight\nimatinib\t1.0\t2.0\ndasatinib\t3.0\t4.0\nsunitinib\t5.0\t6.0\nerlotinib\t7.0\t8.0",
        )
        .unwrap();
        let proteins =
            create_test_tsv("protein\tembed\nABL1\t0.1\nEGFR\t0.2\nKIT\t0.3\nSRC\t0.4").unwrap();

        let mut rows = vec!["chemical\tprotein\tkd".to_string()];
        for (ci, chem) in ["imatinib", "dasatinib", "sunitinib", "erlotinib"]
            .iter()
            .enumerate()
        {
            for (pi, prot) in ["ABL1", "EGFR", "KIT", "SRC"].iter().enumerate() {
                let kd = 10f64.powi(-(ci as i32 + pi as i32));
                rows.push(format!("{chem}\t{prot}\t{kd}"));
            }
        }
        let affinities = create_test_tsv(&rows.join("\n")).unwrap();
        Fixture {
            chemicals,
            proteins,
            affinities,
        }
    }

    #[test]
    fn test_load_dataset_builds_catalog_and_labels() {
        let fixture = complete_fixture();
        let dataset = load_dataset(&fixture.config(LabelTransform::NegLog10)).unwrap();

        assert_eq!(dataset.catalog.chemicals[1], "dasatinib");
        assert_eq!(dataset.catalog.proteins, vec!["ABL1", "EGFR", "KIT", "SRC"]);
        assert_eq!(dataset.catalog.chemical_features.dim(), (4, 2));
        assert_eq!(dataset.catalog.pair_width(), 3);
        assert_eq!(dataset.measurements.len(), 16);

        // dasatinib x KIT has kd = 1e-3.
        let (id, label) = dataset.measurements[6];
        assert_eq!(id, PairIndex::new(1, 2));
        assert_abs_diff_eq!(label, 3.0, epsilon = 1e-12);

        let features = dataset.pair_features(&[PairIndex::new(2, 3)]);
        assert_eq!(features.row(0).to_vec(), vec![5.0, 6.0, 0.4]);
    }

    #[test]
    fn test_identity_transform_keeps_raw_kd() {
        let fixture = complete_fixture();
        let dataset = load_dataset(&fixture.config(LabelTransform::Identity)).unwrap();
        assert_abs_diff_eq!(dataset.measurements[5].1, 0.01, epsilon = 1e-15);
    }

    #[test]
    fn test_split_partitions_pairs_into_pool_and_quadrants() {
        let fixture = complete_fixture();
        let dataset = load_dataset(&fixture.config(LabelTransform::NegLog10)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let state = split(dataset, &SplitConfig::default(), &mut rng).unwrap();

        // Half of four chemicals and half of four proteins are known.
        assert_eq!(state.observed.len(), 4);
        assert_eq!(state.unknown.len(), 12);
        let quadrants = state.quadrants.as_deref().unwrap();
        assert_eq!(quadrants.side.len(), 4);
        assert_eq!(quadrants.repurpose.len(), 4);
        assert_eq!(quadrants.novel.len(), 4);

        let known_chems: AHashSet<usize> = state.observed.ids().iter().map(|id| id.chemical).collect();
        let known_prots: AHashSet<usize> = state.observed.ids().iter().map(|id| id.protein).collect();
        for id in state.unknown.ids() {
            let in_side = quadrants.side.contains(id);
            let in_repurpose = quadrants.repurpose.contains(id);
            let in_novel = quadrants.novel.contains(id);
            assert_eq!([in_side, in_repurpose, in_novel].iter().filter(|&&b| b).count(), 1);
            assert_eq!(in_side, !known_chems.contains(&id.chemical) && known_prots.contains(&id.protein));
            assert_eq!(in_novel, !known_chems.contains(&id.chemical) && !known_prots.contains(&id.protein));
        }
        assert_eq!(state.observed.n_features(), 3);
        assert!(state.partition.is_none());
    }

    #[test]
    fn test_split_is_reproducible_for_a_seed() {
        let fixture = complete_fixture();
        let config = fixture.config(LabelTransform::NegLog10);
        let first = split(
            load_dataset(&config).unwrap(),
            &SplitConfig::default(),
            &mut StdRng::seed_from_u64(9),
        )
        .unwrap();
        let second = split(
            load_dataset(&config).unwrap(),
            &SplitConfig::default(),
            &mut StdRng::seed_from_u64(9),
        )
        .unwrap();
        assert_eq!(first.observed.ids(), second.observed.ids());
        assert_eq!(first.unknown.ids(), second.unknown.ids());
    }

    #[test]
    fn test_full_fractions_leave_nothing_unknown() {
        let fixture = complete_fixture();
        let dataset = load_dataset(&fixture.config(LabelTransform::NegLog10)).unwrap();
        let all_known = SplitConfig {
            known_chemical_fraction: 1.0,
            known_protein_fraction: 1.0,
        };
        let state = split(dataset, &all_known, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(state.observed.len(), 16);
        assert!(state.unknown.is_empty());
    }

    #[test]
    fn test_unknown_entity_is_rejected() {
        let fixture = complete_fixture();
        let affinities =
            create_test_tsv("chemical\tprotein\tkd\nimatinib\tBRAF\t0.5").unwrap();
        let mut config = fixture.config(LabelTransform::NegLog10);
        config.affinities = affinities.path().to_path_buf();
        match load_dataset(&config) {
            Err(DataError::UnknownEntity { kind, name }) => {
                assert_eq!(kind, "protein");
                assert_eq!(name, "BRAF");
            }
            other => panic!("Expected UnknownEntity, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_non_positive_kd_is_rejected_for_log_transform() {
        let fixture = complete_fixture();
        let affinities =
            create_test_tsv("chemical\tprotein\tkd\nimatinib\tABL1\t0.0").unwrap();
        let mut config = fixture.config(LabelTransform::NegLog10);
        config.affinities = affinities.path().to_path_buf();
        assert!(matches!(
            load_dataset(&config),
            Err(DataError::NonPositiveAffinity { .. })
        ));

        config.label_transform = LabelTransform::Identity;
        assert_eq!(load_dataset(&config).unwrap().measurements.len(), 1);
    }

    #[test]
    fn test_duplicate_pair_is_rejected() {
        let fixture = complete_fixture();
        let affinities = create_test_tsv(
            "chemical\tprotein\tkd\nimatinib\tABL1\t0.5\nimatinib\tABL1\t0.7",
        )
        .unwrap();
        let mut config = fixture.config(LabelTransform::NegLog10);
        config.affinities = affinities.path().to_path_buf();
        assert!(matches!(
            load_dataset(&config),
            Err(DataError::DuplicatePair { .. })
        ));
    }

    #[test]
    fn test_entity_table_schema_errors() {
        let missing_key = create_test_tsv("name\tlogp\nimatinib\t1.0").unwrap();
        match load_entity_table(missing_key.path(), "chemical") {
            Err(DataError::ColumnNotFound { column, .. }) => assert_eq!(column, "chemical"),
            other => panic!("Expected ColumnNotFound, got {:?}", other.map(|_| ())),
        }

        let text_feature = create_test_tsv("chemical\tclass\nimatinib\ttyrosine").unwrap();
        assert!(matches!(
            load_entity_table(text_feature.path(), "chemical"),
            Err(DataError::ColumnWrongType { .. })
        ));

        let no_features = create_test_tsv("chemical\nimatinib\ndasatinib").unwrap();
        assert!(matches!(
            load_entity_table(no_features.path(), "chemical"),
            Err(DataError::NoFeatureColumns { .. })
        ));

        let duplicate = create_test_tsv("chemical\tlogp\nimatinib\t1.0\nimatinib\t2.0").unwrap();
        assert!(matches!(
            load_entity_table(duplicate.path(), "chemical"),
            Err(DataError::DuplicateEntity { .. })
        ));

        let missing_value = create_test_tsv("chemical\tlogp\nimatinib\t\ndasatinib\t2.0").unwrap();
        assert!(matches!(
            load_entity_table(missing_value.path(), "chemical"),
            Err(DataError::MissingValuesFound(col)) if col == "logp"
        ));
    }
}
