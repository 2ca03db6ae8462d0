mod content;
mod epoch;
mod index;
mod upgrade;
