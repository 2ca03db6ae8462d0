pub(crate) mod cache;
pub(crate) mod content;
pub(crate) mod epoch;
pub(crate) mod index;
pub(crate) mod init;
pub(crate) mod upgrade;
