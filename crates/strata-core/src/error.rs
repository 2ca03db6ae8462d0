pub use strata_types::error::{Result, ResultExt, StrataError};
