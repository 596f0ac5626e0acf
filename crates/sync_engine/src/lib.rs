mod evaluation;
mod export;
mod locks;
mod sync;

pub use evaluation::EvaluationEngine;
pub use export::{
    render_csv, ExportRecord, DEFAULT_VALID_START_DATE, EXPORT_COLUMNS, VALID_END_DATE,
};
pub use sync::{ReconcileReport, SyncEngine, DEFAULT_RETRY_DELAY, REVIEW_WRITE_ATTEMPTS};
