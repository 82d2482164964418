pub mod record;
pub mod taxonomy;

pub use record::{Record, RecordId, RecordStatus};
pub use taxonomy::{Label, Taxonomy, TaxonomyError, UNCLASSIFIED};
