pub mod clock;
pub mod compress;
pub mod config;
pub mod content;
pub mod crypto;
pub mod envelope;
pub mod epoch;
pub mod error;
pub mod format;
pub mod index;
pub mod pack;
pub mod repo;
pub mod storage;
pub mod upgrade;
pub mod util;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
