//! Workspace-wide constants.

/// Application name, used for default directory names.
pub const APP_NAME: &str = "cellar";

/// Length of the truncated object hashes used in store paths and artifact keys.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Environment variable overriding the store directory.
pub const STORE_ENV: &str = "CELLAR_STORE";

/// Environment variable overriding the scratch directory used for build environments.
pub const SCRATCH_ENV: &str = "CELLAR_SCRATCH";

/// Lock file guarding a store against concurrent builds.
pub const LOCK_FILE: &str = ".lock";

/// Journal file holding artifact records, one JSON object per line.
pub const RECORDS_FILE: &str = "records.jsonl";
