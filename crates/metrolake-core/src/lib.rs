//! Metrolake Core - Common infrastructure for the subway data lake
//!
//! Record model, error taxonomy, retry policy, parquet codec and the
//! runtime plumbing (HTTP, logging, progress, shutdown) shared by every
//! stage of the raw → processed → cleaned pipeline.

pub mod codec;
pub mod error;
pub mod http;
pub mod logging;
pub mod progress;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod time;

// Re-exports for convenience
pub use codec::{DEFAULT_ZSTD_LEVEL, decode_partition, encode_partition, is_valid_parquet};
pub use error::{
    CoercionError, MalformedKeyError, SourceError, StoreError, ValidationFailure,
};
pub use http::{HttpError, SHARED_RUNTIME, block_on_timeout, get_json, http_client};
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use record::{Record, Value, dedup_by_natural_key, sort_canonical};
pub use retry::{RetryPolicy, Retryable, retry_with_backoff};
pub use shutdown::{is_shutdown_requested, request_shutdown, shutdown_flag};
pub use time::{SERVICE_TZ, date_range, day_bounds, local_date, parse_timestamp};
