use ahash::AHashSet;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one chemical-protein pair by its position in the catalog's
/// ordered chemical and protein lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairIndex {
    pub chemical: usize,
    pub protein: usize,
}

impl PairIndex {
    pub fn new(chemical: usize, protein: usize) -> Self {
        Self { chemical, protein }
    }
}

impl fmt::Display for PairIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.chemical, self.protein)
    }
}

impl From<(usize, usize)> for PairIndex {
    fn from((chemical, protein): (usize, usize)) -> Self {
        Self { chemical, protein }
    }
}

/// Output of a single `Regressor::predict` call.
///
/// `values[i]` and `variances[i]` both refer to row `i` of the input matrix.
/// The variance travels with the values instead of being read back from the
/// model afterwards, so there is no ordering hazard between consecutive calls.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub values: Array1<f64>,
    pub variances: Array1<f64>,
}

impl Prediction {
    pub fn new(values: Array1<f64>, variances: Array1<f64>) -> Self {
        Self { values, variances }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    pub fn variances(&self) -> ArrayView1<'_, f64> {
        self.variances.view()
    }
}

/// Whether a selection maximises the score or sweeps the exploration weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionMode {
    Exploit,
    Explore,
}

impl SelectionMode {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Exploit => "exploit",
            Self::Explore => "explore",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Names and per-entity feature vectors of the screened chemicals and proteins.
///
/// Row `c` of `chemical_features` describes `chemicals[c]`; likewise for
/// proteins. A pair's feature row is the chemical row followed by the protein row.
#[derive(Clone, Debug)]
pub struct Catalog {
    pub chemicals: Vec<String>,
    pub proteins: Vec<String>,
    pub chemical_features: Array2<f64>,
    pub protein_features: Array2<f64>,
}

impl Catalog {
    pub fn chemical_features(&self) -> ArrayView2<'_, f64> {
        self.chemical_features.view()
    }

    pub fn pair_width(&self) -> usize {
        self.chemical_features.ncols() + self.protein_features.ncols()
    }

    pub fn chemical_name(&self, id: &PairIndex) -> &str {
        self.chemicals.get(id.chemical).map_or("?", |s| s.as_str())
    }

    pub fn protein_name(&self, id: &PairIndex) -> &str {
        self.proteins.get(id.protein).map_or("?", |s| s.as_str())
    }
}

/// Unknown pairs grouped by which side of the pair has never been observed.
///
/// - `side`: unseen chemical, known protein.
/// - `repurpose`: known chemical, unseen protein.
/// - `novel`: both unseen.
#[derive(Clone, Debug, Default)]
pub struct Quadrants {
    pub side: AHashSet<PairIndex>,
    pub repurpose: AHashSet<PairIndex>,
    pub novel: AHashSet<PairIndex>,
}

impl Quadrants {
    /// The quadrants in acquisition order.
    pub fn groups(&self) -> [(&'static str, &AHashSet<PairIndex>); 3] {
        [
            ("side", &self.side),
            ("repurpose", &self.repurpose),
            ("novel", &self.novel),
        ]
    }
}
