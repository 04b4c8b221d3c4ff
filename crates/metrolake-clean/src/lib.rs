//! metrolake-clean: Normalisation and cleaning between lake layers
//!
//! - `process`: raw → processed (union of raw variants, renames, light
//!   schema check, dedup)
//! - `clean`: processed → cleaned (coercion, dedup, outlier flags,
//!   derived features, quality report), optionally cut into splits
//! - `stops`: event rows exploded per affected subway stop
//!
//! What each dataset looks like is declared once in [`schema`].

pub mod clean;
pub mod coerce;
pub mod features;
pub mod process;
pub mod report;
pub mod schema;
pub mod stops;

pub use clean::{CleanContext, Cleaned, DEFAULT_MAX_COERCION_FAILURE_RATIO, clean, take_split};
pub use coerce::{FieldType, coerce};
pub use features::{CmpOp, Derivation, Fill, add_calendar_features, period_of_day};
pub use process::{Processed, SOURCE_VARIANT_FIELD, process};
pub use report::{FieldStats, QualityReport};
pub use schema::{Bounds, DatasetSchema, FieldSpec, Split, builtin, builtin_names};
pub use stops::{StopDirectory, StopExplode};
